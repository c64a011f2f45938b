//! Controller runner - builds controller futures for each controller family
//!
//! Each `build_*` function returns a Vec of boxed futures that can be composed
//! by the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};
use tracing::error;

use trellis_common::crd::{Cluster, MachineConfig, MachineConfigPool, CLUSTER_SINGLETON};
use trellis_common::{Error, Result};

use crate::clients::{ClusterClient, KubeClusterClient, KubeMachineConfigClient, MachineConfigClient};
use crate::config::OperatorConfig;
use crate::controllers::dnsmasq::{
    DnsmasqClusterReconciler, DnsmasqMachineConfigReconciler, DnsmasqPoolReconciler,
};
use crate::controllers::storage_accounts::{
    self, KubeClusterInventory, StorageAccountManager, StorageAccountsReconciler,
    MACHINE_NAMESPACE,
};
use crate::dynamic::{DynamicHelper, KubeDynamicHelper};
use crate::reconciler::{reconcile, ChildReconciler};

/// A running controller
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

const MACHINE_ROLE_LABEL: &str = "machine.openshift.io/cluster-api-machine-role";

/// Shared state handed to every reconcile of one controller
pub struct ControllerContext<R> {
    reconciler: R,
    clusters: Arc<dyn ClusterClient>,
    config: OperatorConfig,
}

impl<R> ControllerContext<R> {
    /// Wrap `reconciler` for the controller runtime
    pub fn new(reconciler: R, clusters: Arc<dyn ClusterClient>, config: OperatorConfig) -> Self {
        Self {
            reconciler,
            clusters,
            config,
        }
    }
}

async fn reconcile_object<K, R>(object: Arc<K>, ctx: Arc<ControllerContext<R>>) -> Result<Action>
where
    K: Resource + Send + Sync + 'static,
    R: ChildReconciler,
{
    reconcile(
        &ctx.reconciler,
        ctx.clusters.as_ref(),
        &object.name_any(),
        Utc::now(),
    )
    .await
    .into_action()
}

fn error_policy<K, R>(object: Arc<K>, error: &Error, ctx: Arc<ControllerContext<R>>) -> Action
where
    K: Resource,
{
    error!(?error, name = %object.name_any(), "reconciliation failed");
    Action::requeue(ctx.config.error_requeue)
}

/// Build the dnsmasq controllers (pools, MachineConfigs, cluster singleton)
pub fn build_dnsmasq_controllers(client: Client, config: OperatorConfig) -> Vec<ControllerFuture> {
    let clusters: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let pools: Arc<dyn MachineConfigClient> = Arc::new(KubeMachineConfigClient::new(client.clone()));
    let dynamic: Arc<dyn DynamicHelper> = Arc::new(KubeDynamicHelper::new(client.clone()));
    let watcher = || WatcherConfig::default().timeout(config.watch_timeout_secs);

    tracing::info!("- Dnsmasq controllers");

    let pool_ctx = Arc::new(ControllerContext::new(
        DnsmasqPoolReconciler::new(pools.clone(), dynamic.clone()),
        clusters.clone(),
        config.clone(),
    ));
    let pool_ctrl = Controller::new(Api::<MachineConfigPool>::all(client.clone()), watcher())
        .shutdown_on_signal()
        .run(
            reconcile_object::<MachineConfigPool, DnsmasqPoolReconciler>,
            error_policy::<MachineConfigPool, DnsmasqPoolReconciler>,
            pool_ctx,
        )
        .for_each(log_reconcile_result("DnsmasqMachineConfigPool"));

    let mc_ctx = Arc::new(ControllerContext::new(
        DnsmasqMachineConfigReconciler::new(pools.clone(), dynamic.clone()),
        clusters.clone(),
        config.clone(),
    ));
    let mc_ctrl = Controller::new(Api::<MachineConfig>::all(client.clone()), watcher())
        .shutdown_on_signal()
        .run(
            reconcile_object::<MachineConfig, DnsmasqMachineConfigReconciler>,
            error_policy::<MachineConfig, DnsmasqMachineConfigReconciler>,
            mc_ctx,
        )
        .for_each(log_reconcile_result("DnsmasqMachineConfig"));

    let cluster_ctx = Arc::new(ControllerContext::new(
        DnsmasqClusterReconciler::new(pools, dynamic),
        clusters,
        config.clone(),
    ));
    let cluster_ctrl = Controller::new(Api::<Cluster>::all(client), watcher())
        .shutdown_on_signal()
        .run(
            reconcile_object::<Cluster, DnsmasqClusterReconciler>,
            error_policy::<Cluster, DnsmasqClusterReconciler>,
            cluster_ctx,
        )
        .for_each(log_reconcile_result("DnsmasqCluster"));

    vec![Box::pin(pool_ctrl), Box::pin(mc_ctrl), Box::pin(cluster_ctrl)]
}

/// Build the storage account controller around a provider `manager`
///
/// Besides the singleton it watches master Machines, so replacing a master
/// re-evaluates the subnets.
pub fn build_storage_account_controllers(
    client: Client,
    config: OperatorConfig,
    manager: Arc<dyn StorageAccountManager>,
) -> Vec<ControllerFuture> {
    let clusters: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(client.clone()));
    let inventory = Arc::new(KubeClusterInventory::new(client.clone()));
    let watcher = WatcherConfig::default().timeout(config.watch_timeout_secs);
    let machine_resource = storage_accounts::machine_resource();
    let machines: Api<DynamicObject> =
        Api::namespaced_with(client.clone(), MACHINE_NAMESPACE, &machine_resource);

    tracing::info!("- StorageAccounts controller");

    let ctx = Arc::new(ControllerContext::new(
        StorageAccountsReconciler::new(clusters.clone(), inventory, manager),
        clusters,
        config,
    ));

    vec![Box::pin(
        Controller::new(Api::<Cluster>::all(client), watcher.clone())
            .watches_with(machines, machine_resource, watcher, |machine| {
                let is_master = machine
                    .labels()
                    .get(MACHINE_ROLE_LABEL)
                    .is_some_and(|role| role == "master");
                is_master.then(|| ObjectRef::<Cluster>::new(CLUSTER_SINGLETON))
            })
            .shutdown_on_signal()
            .run(
                reconcile_object::<Cluster, StorageAccountsReconciler>,
                error_policy::<Cluster, StorageAccountsReconciler>,
                ctx,
            )
            .for_each(log_reconcile_result(storage_accounts::CONTROLLER_NAME)),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
