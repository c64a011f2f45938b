//! Dnsmasq reconciler for the cluster singleton
//!
//! Domain or address changes on the singleton re-render the MachineConfig of
//! every pool.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use trellis_common::crd::{Cluster, MachineConfigPool, DNSMASQ_ENABLED};
use trellis_common::Result;

use super::{ensure_machine_configs, DnsmasqParams};
use crate::clients::MachineConfigClient;
use crate::dynamic::DynamicHelper;
use crate::reconciler::ChildReconciler;

/// Controller name
pub const CONTROLLER_NAME: &str = "DnsmasqCluster";

/// Re-renders every pool's dnsmasq MachineConfig when the singleton changes
pub struct DnsmasqClusterReconciler {
    pools: Arc<dyn MachineConfigClient>,
    dynamic: Arc<dyn DynamicHelper>,
}

impl DnsmasqClusterReconciler {
    /// Create a reconciler
    pub fn new(pools: Arc<dyn MachineConfigClient>, dynamic: Arc<dyn DynamicHelper>) -> Self {
        Self { pools, dynamic }
    }
}

#[async_trait]
impl ChildReconciler for DnsmasqClusterReconciler {
    type Target = Vec<MachineConfigPool>;
    type Params = DnsmasqParams;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn flag(&self) -> &'static str {
        DNSMASQ_ENABLED
    }

    async fn resolve(
        &self,
        _cluster: &Cluster,
        _request: &str,
    ) -> Result<Option<Vec<MachineConfigPool>>> {
        Ok(Some(self.pools.list_pools().await?))
    }

    async fn desired(
        &self,
        cluster: &Cluster,
        pools: &Vec<MachineConfigPool>,
    ) -> Result<DnsmasqParams> {
        Ok(DnsmasqParams::new(
            cluster,
            pools.iter().map(|pool| pool.name_any()),
        ))
    }

    async fn ensure(
        &self,
        _cluster: &Cluster,
        _pools: &Vec<MachineConfigPool>,
        params: &DnsmasqParams,
    ) -> Result<()> {
        ensure_machine_configs(self.dynamic.as_ref(), params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use trellis_common::crd::{ClusterSpec, MachineConfigPoolSpec};

    use crate::clients::{MockClusterClient, MockMachineConfigClient};
    use crate::dynamic::MockDynamicHelper;
    use crate::reconciler::{reconcile, ReconcileOutcome};

    fn clusters() -> MockClusterClient {
        let mut spec = ClusterSpec {
            domain: "prod.example.com".to_string(),
            api_int_ip: "10.0.0.4".to_string(),
            ingress_ip: "10.0.0.5".to_string(),
            ..Default::default()
        };
        spec.operator_flags
            .insert(DNSMASQ_ENABLED.to_string(), "true".to_string());
        let cluster = Cluster::new("cluster", spec);
        let mut clusters = MockClusterClient::new();
        clusters
            .expect_get_cluster()
            .returning(move || Ok(cluster.clone()));
        clusters
    }

    fn pools(names: &'static [&'static str]) -> MockMachineConfigClient {
        let mut pools = MockMachineConfigClient::new();
        pools.expect_list_pools().returning(move || {
            Ok(names
                .iter()
                .map(|name| MachineConfigPool::new(name, MachineConfigPoolSpec::default()))
                .collect())
        });
        pools
    }

    #[tokio::test]
    async fn every_pool_gets_a_machine_config() {
        let mut dynamic = MockDynamicHelper::new();
        dynamic
            .expect_ensure()
            .withf(|objects| {
                let names: Vec<_> = objects
                    .iter()
                    .filter_map(|o| o.metadata.name.as_deref())
                    .collect();
                names == ["99-master-aro-dns", "99-worker-aro-dns"]
            })
            .times(1)
            .returning(|_| Ok(()));

        let reconciler =
            DnsmasqClusterReconciler::new(Arc::new(pools(&["worker", "master"])), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(), "cluster", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }

    #[tokio::test]
    async fn no_pools_still_ensures_an_empty_set() {
        let mut dynamic = MockDynamicHelper::new();
        dynamic
            .expect_ensure()
            .withf(|objects| objects.is_empty())
            .times(1)
            .returning(|_| Ok(()));

        let reconciler = DnsmasqClusterReconciler::new(Arc::new(pools(&[])), Arc::new(dynamic));
        let outcome = reconcile(&reconciler, &clusters(), "cluster", Utc::now()).await;
        assert!(matches!(outcome, ReconcileOutcome::Done));
    }
}
