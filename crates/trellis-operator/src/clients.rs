//! Kubernetes clients used by the controllers
//!
//! Traits wrap the few API calls each controller makes so reconcile logic
//! can be tested against mocks.

use async_trait::async_trait;
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info};

use trellis_common::crd::{Cluster, MachineConfigPool, StorageAccountsStatus, CLUSTER_SINGLETON};
use trellis_common::retry::{retry_if, RetryConfig};
use trellis_common::{Error, Result};

/// Access to the cluster singleton
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the singleton; `NotFound` when it does not exist
    async fn get_cluster(&self) -> Result<Cluster>;

    /// Replace the storage account snapshot on the singleton's status
    async fn patch_storage_accounts_status(&self, status: &StorageAccountsStatus) -> Result<()>;
}

/// Access to machine config pools
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MachineConfigClient: Send + Sync {
    /// Fetch a pool by name; `None` when it does not exist
    async fn get_pool(&self, name: &str) -> Result<Option<MachineConfigPool>>;

    /// List every pool
    async fn list_pools(&self) -> Result<Vec<MachineConfigPool>>;

    /// Persist `pool` with `finalizer` added
    async fn add_pool_finalizer(&self, pool: &MachineConfigPool, finalizer: &str) -> Result<()>;

    /// Persist `pool` with `finalizer` removed
    async fn remove_pool_finalizer(&self, pool: &MachineConfigPool, finalizer: &str)
        -> Result<()>;
}

/// [`ClusterClient`] backed by the Kubernetes API
pub struct KubeClusterClient {
    api: Api<Cluster>,
}

impl KubeClusterClient {
    /// Create a client for the cluster-scoped singleton
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_cluster(&self) -> Result<Cluster> {
        self.api
            .get_opt(CLUSTER_SINGLETON)
            .await?
            .ok_or_else(|| Error::not_found("Cluster", CLUSTER_SINGLETON))
    }

    async fn patch_storage_accounts_status(&self, status: &StorageAccountsStatus) -> Result<()> {
        let patch = json!({ "status": { "storageAccounts": status } });
        self.api
            .patch_status(CLUSTER_SINGLETON, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("patched storage account status");
        Ok(())
    }
}

/// [`MachineConfigClient`] backed by the Kubernetes API
pub struct KubeMachineConfigClient {
    api: Api<MachineConfigPool>,
}

impl KubeMachineConfigClient {
    /// Create a client for cluster-scoped pools
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
        }
    }

    /// Rewrite the finalizers of pool `name` with `edit`, conditional on the
    /// resourceVersion that was read. Lost races re-read and re-apply.
    ///
    /// Returns false when the pool is gone or `edit` changed nothing.
    async fn update_finalizers<F>(&self, name: &str, edit: F) -> Result<bool>
    where
        F: Fn(&mut Vec<String>) -> bool + Send + Sync,
    {
        let edit = &edit;
        retry_if(&RetryConfig::conflicts(), "pool finalizers", Error::is_conflict, || async move {
            let Some(pool) = self.api.get_opt(name).await? else {
                return Ok(false);
            };
            let mut finalizers = pool.finalizers().to_vec();
            if !edit(&mut finalizers) {
                return Ok(false);
            }
            let patch = finalizer_patch(&pool, &finalizers);
            self.api
                .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
                .await
                .map_err(|e| conflict_or_kube(name, e))?;
            Ok(true)
        })
        .await
    }
}

/// Merge patch replacing the finalizer list, rejected by the API server if
/// the pool changed since it was read
fn finalizer_patch(pool: &MachineConfigPool, finalizers: &[String]) -> serde_json::Value {
    json!({
        "metadata": {
            "resourceVersion": pool.resource_version(),
            "finalizers": finalizers,
        }
    })
}

fn conflict_or_kube(name: &str, error: kube::Error) -> Error {
    match error {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(name),
        other => other.into(),
    }
}

#[async_trait]
impl MachineConfigClient for KubeMachineConfigClient {
    async fn get_pool(&self, name: &str) -> Result<Option<MachineConfigPool>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn list_pools(&self) -> Result<Vec<MachineConfigPool>> {
        Ok(self.api.list(&ListParams::default()).await?.items)
    }

    async fn add_pool_finalizer(&self, pool: &MachineConfigPool, finalizer: &str) -> Result<()> {
        let name = pool.name_any();
        let added = self
            .update_finalizers(&name, |finalizers| {
                if finalizers.iter().any(|f| f == finalizer) {
                    return false;
                }
                finalizers.push(finalizer.to_string());
                true
            })
            .await?;
        if added {
            info!(pool = %name, finalizer, "added finalizer");
        }
        Ok(())
    }

    async fn remove_pool_finalizer(&self, pool: &MachineConfigPool, finalizer: &str) -> Result<()> {
        let name = pool.name_any();
        let removed = self
            .update_finalizers(&name, |finalizers| {
                let before = finalizers.len();
                finalizers.retain(|f| f != finalizer);
                finalizers.len() != before
            })
            .await?;
        if removed {
            info!(pool = %name, finalizer, "removed finalizer");
        }
        Ok(())
    }
}
