//! Storage account firewall controller
//!
//! Keeps the network rules of the cluster's storage accounts in step with the
//! subnets that need access. Provider calls are rate limited, so a reconcile
//! that reached the provider is not repeated within [`MIN_RECONCILE_INTERVAL`]
//! and unchanged parameters skip the provider entirely.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::api::{Api, DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use trellis_common::crd::{Cluster, StorageAccountsStatus, STORAGE_ACCOUNTS_ENABLED};
use trellis_common::{Error, Result};

use crate::clients::ClusterClient;
use crate::reconciler::{ChildReconciler, Snapshot};

/// Controller name
pub const CONTROLLER_NAME: &str = "StorageAccounts";

/// Provider work is not repeated sooner than this after a completed reconcile
pub const MIN_RECONCILE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Namespace holding the cluster's Machine objects
pub const MACHINE_NAMESPACE: &str = "openshift-machine-api";

/// Provider-side storage account operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StorageAccountManager: Send + Sync {
    /// Subset of `subnets` whose access must be managed
    async fn check_cluster_subnets_to_reconcile(&self, subnets: &[String]) -> Result<Vec<String>>;

    /// Grant `subnets` access to every account in `accounts`
    async fn reconcile_accounts(&self, subnets: &[String], accounts: &[String]) -> Result<()>;
}

/// In-cluster facts the controller derives its parameters from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterInventory: Send + Sync {
    /// Resource IDs of the subnets the cluster's machines run in
    async fn cluster_subnets(&self, cluster: &Cluster) -> Result<Vec<String>>;

    /// Name of the storage account backing the image registry
    async fn registry_storage_account(&self) -> Result<String>;
}

/// Parameters of one storage account reconcile
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageAccountParams {
    /// Subnets granted access, sorted
    pub subnets: Vec<String>,
    /// Accounts updated, sorted
    pub accounts: Vec<String>,
}

/// Reconciles storage account network rules for the singleton
pub struct StorageAccountsReconciler {
    clusters: Arc<dyn ClusterClient>,
    inventory: Arc<dyn ClusterInventory>,
    manager: Arc<dyn StorageAccountManager>,
}

impl StorageAccountsReconciler {
    /// Create a reconciler
    pub fn new(
        clusters: Arc<dyn ClusterClient>,
        inventory: Arc<dyn ClusterInventory>,
        manager: Arc<dyn StorageAccountManager>,
    ) -> Self {
        Self {
            clusters,
            inventory,
            manager,
        }
    }
}

#[async_trait]
impl ChildReconciler for StorageAccountsReconciler {
    type Target = ();
    type Params = StorageAccountParams;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn flag(&self) -> &'static str {
        STORAGE_ACCOUNTS_ENABLED
    }

    fn min_interval(&self) -> Option<Duration> {
        Some(MIN_RECONCILE_INTERVAL)
    }

    async fn resolve(&self, _cluster: &Cluster, _request: &str) -> Result<Option<()>> {
        Ok(Some(()))
    }

    fn snapshot(&self, cluster: &Cluster, _target: &()) -> Option<Snapshot<StorageAccountParams>> {
        let status = cluster.status.as_ref()?.storage_accounts.as_ref()?;
        Some(Snapshot {
            params: StorageAccountParams {
                subnets: status.subnets.clone(),
                accounts: status.storage_accounts.clone(),
            },
            completed_at: status.last_completion_time,
        })
    }

    async fn desired(&self, cluster: &Cluster, _target: &()) -> Result<StorageAccountParams> {
        let cluster_subnets = self.inventory.cluster_subnets(cluster).await?;
        let managed = self
            .manager
            .check_cluster_subnets_to_reconcile(&cluster_subnets)
            .await?;

        let mut subnets = cluster.spec.service_subnets.clone();
        subnets.extend(managed);
        subnets.sort();

        let mut accounts = vec![
            format!("cluster{}", cluster.spec.storage_suffix),
            self.inventory.registry_storage_account().await?,
        ];
        accounts.sort();

        Ok(StorageAccountParams { subnets, accounts })
    }

    async fn ensure(
        &self,
        _cluster: &Cluster,
        _target: &(),
        params: &StorageAccountParams,
    ) -> Result<()> {
        info!(
            subnets = params.subnets.len(),
            accounts = ?params.accounts,
            "updating storage account network rules"
        );
        self.manager
            .reconcile_accounts(&params.subnets, &params.accounts)
            .await
    }

    async fn record(
        &self,
        _cluster: &Cluster,
        _target: &(),
        params: StorageAccountParams,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let status = StorageAccountsStatus {
            last_completion_time: Some(now),
            subnets: params.subnets,
            storage_accounts: params.accounts,
        };
        self.clusters.patch_storage_accounts_status(&status).await
    }
}

/// [`ClusterInventory`] reading Machines and the image registry config
pub struct KubeClusterInventory {
    client: Client,
}

impl KubeClusterInventory {
    /// Create an inventory using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// API resource of cluster Machines
pub(crate) fn machine_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("machine.openshift.io", "v1beta1", "Machine"))
}

fn registry_config_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        "imageregistry.operator.openshift.io",
        "v1",
        "Config",
    ))
}

/// Subscription segment of a resource ID
fn subscription_of(resource_id: &str) -> Option<&str> {
    let mut segments = resource_id.split('/').skip_while(|s| !s.eq_ignore_ascii_case("subscriptions"));
    segments.next()?;
    segments.next().filter(|s| !s.is_empty())
}

/// Subnet resource ID from a Machine's provider spec
fn machine_subnet(subscription: &str, machine: &DynamicObject) -> Option<String> {
    let value = machine.data.pointer("/spec/providerSpec/value")?;
    let field = |name: &str| value.get(name).and_then(|v| v.as_str()).filter(|s| !s.is_empty());
    Some(format!(
        "/subscriptions/{subscription}/resourceGroups/{}/providers/Microsoft.Network/virtualNetworks/{}/subnets/{}",
        field("networkResourceGroup")?,
        field("vnet")?,
        field("subnet")?,
    ))
}

#[async_trait]
impl ClusterInventory for KubeClusterInventory {
    async fn cluster_subnets(&self, cluster: &Cluster) -> Result<Vec<String>> {
        let subscription = subscription_of(&cluster.spec.resource_id).ok_or_else(|| {
            Error::validation_for_field(
                "spec.resourceId",
                format!("no subscription in {:?}", cluster.spec.resource_id),
            )
        })?;

        let machines: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), MACHINE_NAMESPACE, &machine_resource());
        let mut subnets: Vec<String> = machines
            .list(&Default::default())
            .await?
            .items
            .iter()
            .filter_map(|m| machine_subnet(subscription, m))
            .collect();
        subnets.sort();
        subnets.dedup();
        Ok(subnets)
    }

    async fn registry_storage_account(&self) -> Result<String> {
        let configs: Api<DynamicObject> = Api::all_with(self.client.clone(), &registry_config_resource());
        let config = configs.get("cluster").await?;
        config
            .data
            .pointer("/spec/storage/azure/accountName")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::validation_for_field(
                    "spec.storage.azure",
                    "image registry config has no storage account",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use trellis_common::crd::{ClusterSpec, ClusterStatus};

    use crate::clients::MockClusterClient;
    use crate::reconciler::{reconcile, ReconcileOutcome};

    fn cluster(status: Option<StorageAccountsStatus>) -> Cluster {
        let mut spec = ClusterSpec {
            storage_suffix: "x7k2p".to_string(),
            service_subnets: vec!["svc-b".to_string(), "svc-a".to_string()],
            ..Default::default()
        };
        spec.operator_flags
            .insert(STORAGE_ACCOUNTS_ENABLED.to_string(), "true".to_string());
        let mut cluster = Cluster::new("cluster", spec);
        cluster.status = Some(ClusterStatus {
            storage_accounts: status,
        });
        cluster
    }

    fn inventory() -> MockClusterInventory {
        let mut inventory = MockClusterInventory::new();
        inventory
            .expect_cluster_subnets()
            .returning(|_| Ok(vec!["node-subnet".to_string(), "ignored".to_string()]));
        inventory
            .expect_registry_storage_account()
            .returning(|| Ok("imageregistry".to_string()));
        inventory
    }

    fn expected() -> StorageAccountParams {
        StorageAccountParams {
            subnets: vec![
                "node-subnet".to_string(),
                "svc-a".to_string(),
                "svc-b".to_string(),
            ],
            accounts: vec!["clusterx7k2p".to_string(), "imageregistry".to_string()],
        }
    }

    /// Cluster client whose status patches feed back into the next read
    fn stateful_clusters(initial: Cluster) -> MockClusterClient {
        let state = Arc::new(Mutex::new(initial));
        let mut clusters = MockClusterClient::new();
        let read = state.clone();
        clusters
            .expect_get_cluster()
            .returning(move || Ok(read.lock().unwrap().clone()));
        clusters
            .expect_patch_storage_accounts_status()
            .returning(move |status| {
                state.lock().unwrap().status = Some(ClusterStatus {
                    storage_accounts: Some(status.clone()),
                });
                Ok(())
            });
        clusters
    }

    fn manager_filtering(calls: usize) -> MockStorageAccountManager {
        let mut manager = MockStorageAccountManager::new();
        manager
            .expect_check_cluster_subnets_to_reconcile()
            .returning(|subnets| {
                Ok(subnets
                    .iter()
                    .filter(|s| s.as_str() != "ignored")
                    .cloned()
                    .collect())
            });
        manager
            .expect_reconcile_accounts()
            .times(calls)
            .returning(|_, _| Ok(()));
        manager
    }

    // ==========================================================================
    // Story Tests
    // ==========================================================================

    /// Story: the first reconcile reaches the provider and records a snapshot;
    /// a second reconcile after the interval with the same inputs does not
    #[tokio::test]
    async fn second_reconcile_with_same_inputs_skips_provider() {
        let clusters = Arc::new(stateful_clusters(cluster(None)));
        let reconciler = StorageAccountsReconciler::new(
            clusters.clone(),
            Arc::new(inventory()),
            Arc::new(manager_filtering(1)),
        );

        let first = Utc::now();
        let outcome = reconcile(&reconciler, clusters.as_ref(), "cluster", first).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));

        let later = first + chrono::Duration::hours(2);
        let outcome = reconcile(&reconciler, clusters.as_ref(), "cluster", later).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));

        let recorded = clusters.get_cluster().await.unwrap();
        let status = recorded.status.unwrap().storage_accounts.unwrap();
        assert_eq!(status.subnets, expected().subnets);
        assert_eq!(status.storage_accounts, expected().accounts);
        assert_eq!(status.last_completion_time, Some(first));
    }

    #[tokio::test]
    async fn within_an_hour_of_completion_requeues() {
        let now = Utc::now();
        let completed = now - chrono::Duration::minutes(15);
        let clusters = stateful_clusters(cluster(Some(StorageAccountsStatus {
            last_completion_time: Some(completed),
            ..Default::default()
        })));
        let reconciler = StorageAccountsReconciler::new(
            Arc::new(MockClusterClient::new()),
            Arc::new(MockClusterInventory::new()),
            Arc::new(MockStorageAccountManager::new()),
        );

        let outcome = reconcile(&reconciler, &clusters, "cluster", now).await;
        match outcome {
            ReconcileOutcome::RetryAfter(d) => assert_eq!(d, Duration::from_secs(45 * 60)),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    /// Story: the provider answers 429 with Retry-After: 30
    #[tokio::test]
    async fn provider_throttling_requeues_after_hint() {
        let clusters = stateful_clusters(cluster(None));
        let mut manager = MockStorageAccountManager::new();
        manager
            .expect_check_cluster_subnets_to_reconcile()
            .returning(|s| Ok(s.to_vec()));
        manager.expect_reconcile_accounts().returning(|_, _| {
            Err(Error::provider_response(
                429,
                Some("30".to_string()),
                "too many requests",
            ))
        });
        let reconciler = StorageAccountsReconciler::new(
            Arc::new(MockClusterClient::new()),
            Arc::new(inventory()),
            Arc::new(manager),
        );

        let outcome = reconcile(&reconciler, &clusters, "cluster", Utc::now()).await;
        match outcome {
            ReconcileOutcome::RetryAfter(d) => assert_eq!(d, Duration::from_secs(30)),
            other => panic!("expected RetryAfter, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn changed_inputs_reach_the_provider_again() {
        let clusters = Arc::new(stateful_clusters(cluster(Some(StorageAccountsStatus {
            last_completion_time: Some(Utc::now() - chrono::Duration::hours(3)),
            subnets: vec!["svc-a".to_string()],
            storage_accounts: expected().accounts,
        }))));
        let reconciler = StorageAccountsReconciler::new(
            clusters.clone(),
            Arc::new(inventory()),
            Arc::new(manager_filtering(1)),
        );

        let outcome = reconcile(&reconciler, clusters.as_ref(), "cluster", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    // ==========================================================================
    // Inventory parsing
    // ==========================================================================

    #[test]
    fn subscription_is_read_from_resource_id() {
        assert_eq!(
            subscription_of("/subscriptions/abc/resourceGroups/rg/providers/x/clusters/c"),
            Some("abc")
        );
        assert_eq!(subscription_of("/resourceGroups/rg"), None);
        assert_eq!(subscription_of(""), None);
    }

    #[test]
    fn machine_subnet_is_built_from_provider_spec() {
        let machine: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "Machine",
            "metadata": { "name": "master-0" },
            "spec": { "providerSpec": { "value": {
                "networkResourceGroup": "vnet-rg",
                "vnet": "vnet",
                "subnet": "master"
            }}}
        }))
        .unwrap();

        assert_eq!(
            machine_subnet("abc", &machine).as_deref(),
            Some("/subscriptions/abc/resourceGroups/vnet-rg/providers/Microsoft.Network/virtualNetworks/vnet/subnets/master")
        );
    }

    #[test]
    fn machine_without_network_is_skipped() {
        let machine: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "machine.openshift.io/v1beta1",
            "kind": "Machine",
            "metadata": { "name": "worker-0" },
            "spec": {}
        }))
        .unwrap();
        assert_eq!(machine_subnet("abc", &machine), None);
    }
}
