//! Dnsmasq reconciler for machine config pools

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use trellis_common::crd::{Cluster, MachineConfigPool, DNSMASQ_ENABLED};
use trellis_common::Result;

use super::{ensure_machine_configs, machine_config_name, DnsmasqParams};
use crate::clients::MachineConfigClient;
use crate::dynamic::DynamicHelper;
use crate::reconciler::ChildReconciler;

/// Controller name, also used as the pool finalizer
pub const POOL_FINALIZER: &str = "DnsmasqMachineConfigPool";

/// Keeps the dnsmasq MachineConfig of each pool, removing it with the pool
pub struct DnsmasqPoolReconciler {
    pools: Arc<dyn MachineConfigClient>,
    dynamic: Arc<dyn DynamicHelper>,
}

impl DnsmasqPoolReconciler {
    /// Create a reconciler
    pub fn new(pools: Arc<dyn MachineConfigClient>, dynamic: Arc<dyn DynamicHelper>) -> Self {
        Self { pools, dynamic }
    }
}

#[async_trait]
impl ChildReconciler for DnsmasqPoolReconciler {
    type Target = MachineConfigPool;
    type Params = DnsmasqParams;

    fn name(&self) -> &'static str {
        POOL_FINALIZER
    }

    fn flag(&self) -> &'static str {
        DNSMASQ_ENABLED
    }

    fn finalizer(&self) -> Option<&'static str> {
        Some(POOL_FINALIZER)
    }

    async fn resolve(&self, _cluster: &Cluster, request: &str) -> Result<Option<MachineConfigPool>> {
        self.pools.get_pool(request).await
    }

    fn metadata<'a>(&self, target: &'a MachineConfigPool) -> Option<&'a ObjectMeta> {
        Some(&target.metadata)
    }

    async fn finalize(&self, pool: &MachineConfigPool) -> Result<()> {
        self.dynamic
            .ensure_deleted("MachineConfig", "", &machine_config_name(&pool.name_any()))
            .await
    }

    async fn add_finalizer(&self, pool: &MachineConfigPool) -> Result<()> {
        self.pools.add_pool_finalizer(pool, POOL_FINALIZER).await
    }

    async fn remove_finalizer(&self, pool: &MachineConfigPool) -> Result<()> {
        self.pools.remove_pool_finalizer(pool, POOL_FINALIZER).await
    }

    async fn desired(&self, cluster: &Cluster, pool: &MachineConfigPool) -> Result<DnsmasqParams> {
        Ok(DnsmasqParams::new(cluster, [pool.name_any()]))
    }

    async fn ensure(
        &self,
        _cluster: &Cluster,
        _pool: &MachineConfigPool,
        params: &DnsmasqParams,
    ) -> Result<()> {
        ensure_machine_configs(self.dynamic.as_ref(), params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use trellis_common::crd::{ClusterSpec, MachineConfigPoolSpec};

    use crate::clients::{MockClusterClient, MockMachineConfigClient};
    use crate::dynamic::MockDynamicHelper;
    use crate::reconciler::{reconcile, ReconcileOutcome};

    fn clusters(enabled: bool) -> MockClusterClient {
        let mut spec = ClusterSpec {
            domain: "prod.example.com".to_string(),
            api_int_ip: "10.0.0.4".to_string(),
            ingress_ip: "10.0.0.5".to_string(),
            ..Default::default()
        };
        spec.operator_flags
            .insert(DNSMASQ_ENABLED.to_string(), enabled.to_string());
        let cluster = Cluster::new("cluster", spec);
        let mut clusters = MockClusterClient::new();
        clusters
            .expect_get_cluster()
            .returning(move || Ok(cluster.clone()));
        clusters
    }

    fn pool(finalizers: &[&str], deleting: bool) -> MachineConfigPool {
        let mut pool = MachineConfigPool::new("custom", MachineConfigPoolSpec::default());
        if !finalizers.is_empty() {
            pool.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        if deleting {
            pool.metadata.deletion_timestamp = Some(Time(Utc::now()));
        }
        pool
    }

    fn pools_returning(found: Option<MachineConfigPool>) -> MockMachineConfigClient {
        let mut pools = MockMachineConfigClient::new();
        pools
            .expect_get_pool()
            .withf(|name| name == "custom")
            .returning(move |_| Ok(found.clone()));
        pools
    }

    // ==========================================================================
    // Story Tests: finalizer lifecycle
    // ==========================================================================

    /// Story: a deleted pool carrying the finalizer gets its MachineConfig
    /// removed once and the finalizer dropped once
    #[tokio::test]
    async fn deleted_pool_is_finalized_once() {
        let mut pools = pools_returning(Some(pool(&[POOL_FINALIZER], true)));
        pools
            .expect_remove_pool_finalizer()
            .withf(|_, finalizer| finalizer == POOL_FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));
        pools.expect_add_pool_finalizer().never();

        let mut dynamic = MockDynamicHelper::new();
        dynamic
            .expect_ensure_deleted()
            .withf(|kind, namespace, name| {
                kind == "MachineConfig" && namespace.is_empty() && name == "99-custom-aro-dns"
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        dynamic.expect_ensure().never();

        let reconciler = DnsmasqPoolReconciler::new(Arc::new(pools), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(true), "custom", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test]
    async fn deleted_pool_without_finalizer_is_left_alone() {
        let mut pools = pools_returning(Some(pool(&["other"], true)));
        pools.expect_remove_pool_finalizer().never();

        let mut dynamic = MockDynamicHelper::new();
        dynamic.expect_ensure_deleted().never();
        dynamic.expect_ensure().never();

        let reconciler = DnsmasqPoolReconciler::new(Arc::new(pools), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(true), "custom", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test]
    async fn live_pool_gets_machine_config_and_finalizer() {
        let mut pools = pools_returning(Some(pool(&[], false)));
        pools
            .expect_add_pool_finalizer()
            .withf(|pool, finalizer| pool.name_any() == "custom" && finalizer == POOL_FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut dynamic = MockDynamicHelper::new();
        dynamic
            .expect_ensure()
            .withf(|objects| {
                objects.len() == 1
                    && objects[0].metadata.name.as_deref() == Some("99-custom-aro-dns")
            })
            .times(1)
            .returning(|_| Ok(()));

        let reconciler = DnsmasqPoolReconciler::new(Arc::new(pools), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(true), "custom", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test]
    async fn pool_with_finalizer_is_not_patched_again() {
        let mut pools = pools_returning(Some(pool(&[POOL_FINALIZER], false)));
        pools.expect_add_pool_finalizer().never();

        let mut dynamic = MockDynamicHelper::new();
        dynamic.expect_ensure().times(1).returning(|_| Ok(()));

        let reconciler = DnsmasqPoolReconciler::new(Arc::new(pools), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(true), "custom", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test]
    async fn missing_pool_does_nothing() {
        let pools = pools_returning(None);
        let mut dynamic = MockDynamicHelper::new();
        dynamic.expect_ensure().never();

        let reconciler = DnsmasqPoolReconciler::new(Arc::new(pools), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(true), "custom", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test]
    async fn disabled_controller_never_reads_pools() {
        let mut pools = MockMachineConfigClient::new();
        pools.expect_get_pool().never();
        let reconciler =
            DnsmasqPoolReconciler::new(Arc::new(pools), Arc::new(MockDynamicHelper::new()));

        let outcome = reconcile(&reconciler, &clusters(false), "custom", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }
}
