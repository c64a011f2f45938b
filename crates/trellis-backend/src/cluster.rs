//! Default resource manager for managed clusters

use std::sync::Arc;

use async_trait::async_trait;

use trellis_common::crd::ClusterDocument;
use trellis_common::Result;
use trellis_store::ClusterDocuments;

use crate::install::{InstallConfig, Installer, Provisioner};
use crate::manager::{ManagerFactory, ResourceManager};

/// Resource manager delegating provider work to a [`Provisioner`]
///
/// Creation runs the install workflow; the other operations are single calls.
pub struct ClusterManager {
    doc: ClusterDocument,
    provisioner: Arc<dyn Provisioner>,
    installer: Installer,
}

impl ClusterManager {
    /// Bind a manager to one leased document
    pub fn new(
        doc: ClusterDocument,
        documents: ClusterDocuments,
        provisioner: Arc<dyn Provisioner>,
        config: InstallConfig,
    ) -> Self {
        let installer = Installer::new(documents, provisioner.clone(), config);
        Self {
            doc,
            provisioner,
            installer,
        }
    }
}

#[async_trait]
impl ResourceManager for ClusterManager {
    async fn create(&self) -> Result<()> {
        self.installer.install(&self.doc.key).await
    }

    async fn update(&self) -> Result<()> {
        self.provisioner.update_cluster(&self.doc).await
    }

    async fn admin_update(&self) -> Result<()> {
        self.provisioner.admin_update(&self.doc).await
    }

    async fn delete(&self) -> Result<()> {
        self.provisioner.delete_cluster(&self.doc).await
    }
}

/// Builds a [`ClusterManager`] per leased document
pub struct ClusterManagerFactory {
    provisioner: Arc<dyn Provisioner>,
    config: InstallConfig,
}

impl ClusterManagerFactory {
    /// Share one provisioner and install configuration across managers
    pub fn new(provisioner: Arc<dyn Provisioner>, config: InstallConfig) -> Self {
        Self {
            provisioner,
            config,
        }
    }
}

impl ManagerFactory for ClusterManagerFactory {
    fn new_manager(
        &self,
        doc: &ClusterDocument,
        documents: ClusterDocuments,
    ) -> Result<Arc<dyn ResourceManager>> {
        Ok(Arc::new(ClusterManager::new(
            doc.clone(),
            documents,
            self.provisioner.clone(),
            self.config.clone(),
        )))
    }
}
