//! Resource manager seam
//!
//! A resource manager performs the actual provisioning work for one leased
//! document. Every operation must be safe to run again after a crash: the
//! dispatcher re-executes the operation for the persisted state on the next
//! lease.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use trellis_common::crd::ClusterDocument;
use trellis_common::Result;
use trellis_store::ClusterDocuments;

/// Lifecycle operations for one managed cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Provision the cluster; may start or resume the install workflow
    async fn create(&self) -> Result<()>;

    /// Apply a customer-requested update
    async fn update(&self) -> Result<()>;

    /// Apply operator-requested maintenance
    async fn admin_update(&self) -> Result<()>;

    /// Tear the cluster down
    async fn delete(&self) -> Result<()>;
}

/// Builds a manager for each leased document
#[cfg_attr(test, automock)]
pub trait ManagerFactory: Send + Sync {
    /// Create a manager bound to `doc`.
    ///
    /// `documents` carries the worker's lease, so the manager can patch the
    /// document it is working on.
    fn new_manager(
        &self,
        doc: &ClusterDocument,
        documents: ClusterDocuments,
    ) -> Result<Arc<dyn ResourceManager>>;
}
