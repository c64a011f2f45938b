//! Install phase sequencer
//!
//! A fresh install walks `DeployStorage -> DeployResources -> RemoveBootstrap`.
//! Only the phase still to run is persisted. A phase that fails leaves the
//! document on that phase, so the next lease runs it again; every phase must
//! therefore tolerate being repeated.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use trellis_common::crd::{ClusterDocument, Install, InstallPhase};
use trellis_common::{Error, Result};
use trellis_store::ClusterDocuments;

/// Settings shared by every install phase
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstallConfig {
    /// Region to deploy into
    pub location: String,
    /// Base DNS domain of the cluster
    pub domain: String,
    /// Release the cluster is installed at
    pub version: String,
}

/// Whether a phase finished its work
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PhaseStatus {
    /// The phase is done; advance to the next one
    Complete,
    /// Long-running work was started; run this phase again on a later lease
    Pending,
}

/// Provider-specific provisioning work
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Create the storage the bootstrap node boots from
    async fn deploy_storage(&self, doc: &ClusterDocument, config: &InstallConfig)
        -> Result<PhaseStatus>;

    /// Create networking, load balancers and machines
    async fn deploy_resources(
        &self,
        doc: &ClusterDocument,
        config: &InstallConfig,
    ) -> Result<PhaseStatus>;

    /// Remove the bootstrap node and its resources
    async fn remove_bootstrap(
        &self,
        doc: &ClusterDocument,
        config: &InstallConfig,
    ) -> Result<PhaseStatus>;

    /// Apply a customer-requested update to a running cluster
    async fn update_cluster(&self, doc: &ClusterDocument) -> Result<()>;

    /// Apply operator-requested maintenance to a running cluster
    async fn admin_update(&self, doc: &ClusterDocument) -> Result<()>;

    /// Delete every resource belonging to the cluster
    async fn delete_cluster(&self, doc: &ClusterDocument) -> Result<()>;
}

/// Runs install phases for one leased document
pub struct Installer {
    documents: ClusterDocuments,
    provisioner: Arc<dyn Provisioner>,
    config: InstallConfig,
}

impl Installer {
    /// Create an installer writing through `documents`
    pub fn new(
        documents: ClusterDocuments,
        provisioner: Arc<dyn Provisioner>,
        config: InstallConfig,
    ) -> Self {
        Self {
            documents,
            provisioner,
            config,
        }
    }

    /// Start or resume the install workflow of `key`.
    ///
    /// Returns once the workflow is finished (install record cleared), a
    /// phase reports [`PhaseStatus::Pending`], or a phase fails.
    pub async fn install(&self, key: &str) -> Result<()> {
        let mut doc = self
            .documents
            .patch_with_lease(key, &|doc| {
                if doc.properties.install.is_none() {
                    doc.properties.install = Some(Install::default());
                }
                Ok(())
            })
            .await?;

        loop {
            let phase = match &doc.properties.install {
                Some(install) => install.phase,
                None => return Ok(()),
            };

            info!(cluster = %key, phase = %phase, "running install phase");
            if self.run_phase(phase, &doc).await? == PhaseStatus::Pending {
                debug!(cluster = %key, phase = %phase, "install phase pending");
                return Ok(());
            }

            doc = match phase.next() {
                Some(next) => self.advance(key, phase, next).await?,
                None => {
                    self.finish(key, phase).await?;
                    info!(cluster = %key, "install finished");
                    return Ok(());
                }
            };
        }
    }

    async fn run_phase(&self, phase: InstallPhase, doc: &ClusterDocument) -> Result<PhaseStatus> {
        match phase {
            InstallPhase::DeployStorage => self.provisioner.deploy_storage(doc, &self.config).await,
            InstallPhase::DeployResources => {
                self.provisioner.deploy_resources(doc, &self.config).await
            }
            InstallPhase::RemoveBootstrap => {
                self.provisioner.remove_bootstrap(doc, &self.config).await
            }
            InstallPhase::Unrecognized => Err(Error::protocol_violation(format!(
                "cluster {} has an unrecognized install phase",
                doc.key
            ))),
        }
    }

    /// Move `completed` to `next`, refusing if the persisted phase moved
    async fn advance(
        &self,
        key: &str,
        completed: InstallPhase,
        next: InstallPhase,
    ) -> Result<ClusterDocument> {
        self.documents
            .patch_with_lease(key, &move |doc| {
                match doc.properties.install.as_mut() {
                    Some(install) if install.phase == completed => {
                        install.phase = next;
                        Ok(())
                    }
                    other => Err(phase_moved(key, completed, other.map(|i| i.phase))),
                }
            })
            .await
    }

    /// Clear the install record after the terminal phase
    async fn finish(&self, key: &str, completed: InstallPhase) -> Result<ClusterDocument> {
        self.documents
            .patch_with_lease(key, &move |doc| {
                let current = doc.properties.install.as_ref().map(|i| i.phase);
                if current != Some(completed) {
                    return Err(phase_moved(key, completed, current));
                }
                doc.properties.install = None;
                Ok(())
            })
            .await
    }
}

fn phase_moved(key: &str, expected: InstallPhase, found: Option<InstallPhase>) -> Error {
    let found = found.map_or_else(|| "none".to_string(), |p| p.to_string());
    Error::protocol_violation(format!(
        "install phase of {key} changed from {expected} to {found} while the phase ran"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use trellis_store::{DocumentStore, MemoryDocumentStore};

    async fn leased_with(
        install: Option<Install>,
    ) -> (Arc<MemoryDocumentStore>, ClusterDocuments) {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut doc = ClusterDocument::new("a");
        doc.properties.install = install;
        store.create(doc).await.unwrap();
        let documents = ClusterDocuments::new(store.clone(), "worker-1");
        documents.dequeue().await.unwrap().unwrap();
        (store, documents)
    }

    fn at(phase: InstallPhase) -> Option<Install> {
        Some(Install { phase })
    }

    /// Records the order phases ran in
    fn recording() -> (MockProvisioner, Arc<Mutex<Vec<InstallPhase>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut provisioner = MockProvisioner::new();

        let c = calls.clone();
        provisioner.expect_deploy_storage().returning(move |_, _| {
            c.lock().unwrap().push(InstallPhase::DeployStorage);
            Ok(PhaseStatus::Complete)
        });
        let c = calls.clone();
        provisioner.expect_deploy_resources().returning(move |_, _| {
            c.lock().unwrap().push(InstallPhase::DeployResources);
            Ok(PhaseStatus::Complete)
        });
        let c = calls.clone();
        provisioner.expect_remove_bootstrap().returning(move |_, _| {
            c.lock().unwrap().push(InstallPhase::RemoveBootstrap);
            Ok(PhaseStatus::Complete)
        });
        (provisioner, calls)
    }

    #[tokio::test]
    async fn fresh_install_runs_every_phase_in_order() {
        let (store, documents) = leased_with(None).await;
        let (provisioner, calls) = recording();
        let installer = Installer::new(documents, Arc::new(provisioner), InstallConfig::default());

        installer.install("a").await.unwrap();

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                InstallPhase::DeployStorage,
                InstallPhase::DeployResources,
                InstallPhase::RemoveBootstrap
            ]
        );
        assert!(store.get("a").await.unwrap().properties.install.is_none());
    }

    /// Story: a worker crashes during a phase; the next lease repeats that
    /// phase once and advances exactly one step past it
    #[tokio::test]
    async fn resume_repeats_the_interrupted_phase_once() {
        let (store, documents) = leased_with(at(InstallPhase::DeployResources)).await;

        let mut crashing = MockProvisioner::new();
        crashing
            .expect_deploy_resources()
            .times(1)
            .returning(|_, _| Err(Error::operation_failed("deployResources", "node lost")));
        let installer = Installer::new(
            documents.clone(),
            Arc::new(crashing),
            InstallConfig::default(),
        );
        assert!(installer.install("a").await.is_err());
        assert_eq!(
            store.get("a").await.unwrap().properties.install,
            at(InstallPhase::DeployResources)
        );

        let mut resumed = MockProvisioner::new();
        resumed.expect_deploy_storage().never();
        resumed
            .expect_deploy_resources()
            .times(1)
            .returning(|_, _| Ok(PhaseStatus::Complete));
        resumed
            .expect_remove_bootstrap()
            .times(1)
            .returning(|_, _| Err(Error::operation_failed("removeBootstrap", "busy")));
        let installer = Installer::new(documents, Arc::new(resumed), InstallConfig::default());

        assert!(installer.install("a").await.is_err());
        assert_eq!(
            store.get("a").await.unwrap().properties.install,
            at(InstallPhase::RemoveBootstrap)
        );
    }

    #[tokio::test]
    async fn pending_phase_stops_without_advancing() {
        let (store, documents) = leased_with(None).await;

        let mut provisioner = MockProvisioner::new();
        provisioner
            .expect_deploy_storage()
            .times(1)
            .returning(|_, _| Ok(PhaseStatus::Pending));
        provisioner.expect_deploy_resources().never();
        let installer = Installer::new(documents, Arc::new(provisioner), InstallConfig::default());

        installer.install("a").await.unwrap();
        assert_eq!(
            store.get("a").await.unwrap().properties.install,
            at(InstallPhase::DeployStorage)
        );
    }

    #[tokio::test]
    async fn unrecognized_phase_is_refused() {
        let (store, documents) = leased_with(at(InstallPhase::Unrecognized)).await;
        let mut provisioner = MockProvisioner::new();
        provisioner.expect_deploy_storage().never();
        provisioner.expect_deploy_resources().never();
        provisioner.expect_remove_bootstrap().never();
        let installer = Installer::new(documents, Arc::new(provisioner), InstallConfig::default());

        let err = installer.install("a").await.unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(
            store.get("a").await.unwrap().properties.install,
            at(InstallPhase::Unrecognized)
        );
    }

    #[tokio::test]
    async fn install_requires_the_lease() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.create(ClusterDocument::new("a")).await.unwrap();
        let documents = ClusterDocuments::new(store.clone(), "worker-1");
        let (provisioner, calls) = recording();
        let installer = Installer::new(documents, Arc::new(provisioner), InstallConfig::default());

        let err = installer.install("a").await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost { .. }));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn advance_refuses_a_moved_phase() {
        let (store, documents) = leased_with(at(InstallPhase::RemoveBootstrap)).await;
        let installer = Installer::new(
            documents,
            Arc::new(MockProvisioner::new()),
            InstallConfig::default(),
        );

        let err = installer
            .advance("a", InstallPhase::DeployStorage, InstallPhase::DeployResources)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation { .. }));
        assert_eq!(
            store.get("a").await.unwrap().properties.install,
            at(InstallPhase::RemoveBootstrap)
        );
    }
}
