//! Dnsmasq reconciler for the rendered MachineConfigs
//!
//! Restores a `99-<pool>-aro-dns` MachineConfig that was edited or deleted,
//! as long as its pool still exists.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;

use trellis_common::crd::{Cluster, MachineConfigPool, DNSMASQ_ENABLED};
use trellis_common::Result;

use super::{ensure_machine_configs, pool_for_machine_config, DnsmasqParams};
use crate::clients::MachineConfigClient;
use crate::dynamic::DynamicHelper;
use crate::reconciler::ChildReconciler;

/// Controller name
pub const CONTROLLER_NAME: &str = "DnsmasqMachineConfig";

/// Restores a dnsmasq MachineConfig that was edited or deleted
pub struct DnsmasqMachineConfigReconciler {
    pools: Arc<dyn MachineConfigClient>,
    dynamic: Arc<dyn DynamicHelper>,
}

impl DnsmasqMachineConfigReconciler {
    /// Create a reconciler
    pub fn new(pools: Arc<dyn MachineConfigClient>, dynamic: Arc<dyn DynamicHelper>) -> Self {
        Self { pools, dynamic }
    }
}

#[async_trait]
impl ChildReconciler for DnsmasqMachineConfigReconciler {
    type Target = MachineConfigPool;
    type Params = DnsmasqParams;

    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    fn flag(&self) -> &'static str {
        DNSMASQ_ENABLED
    }

    async fn resolve(&self, _cluster: &Cluster, request: &str) -> Result<Option<MachineConfigPool>> {
        match pool_for_machine_config(request) {
            Some(pool) => self.pools.get_pool(pool).await,
            None => Ok(None),
        }
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
