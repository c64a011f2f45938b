//! Provisioning state machine
//!
//! One cycle runs the resource manager operation selected by the document's
//! persisted state, then records the result with a single lease-checked
//! write. The next state is computed by [`transition`] from the freshly read
//! properties, never from anything held in memory across the operation, so a
//! crash anywhere in the cycle simply re-runs the operation on the next lease.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use trellis_common::crd::{ClusterDocument, ClusterProperties, ProvisioningState};
use trellis_common::{Error, Result};
use trellis_store::ClusterDocuments;

use crate::config::BackendConfig;
use crate::manager::ResourceManager;

/// What to do with a document once its operation has returned
#[derive(Clone, Debug, PartialEq)]
pub enum Step {
    /// Write these properties and release the lease
    Persist(ClusterProperties),
    /// Remove the document
    Remove,
    /// Leave the document for a later lease
    Defer,
}

/// Compute the next properties from the persisted ones and the operation result.
///
/// `failure` is the message of a failed operation, `None` on success.
pub fn transition(props: &ClusterProperties, failure: Option<&str>) -> Step {
    use ProvisioningState::*;

    let mut next = props.clone();
    match (props.provisioning_state, failure) {
        (Creating | Updating, None) => {
            if props.install.is_none() {
                next.provisioning_state = Succeeded;
                next.failed_provisioning_state = None;
            }
            Step::Persist(next)
        }
        (state @ (Creating | Updating), Some(_)) => {
            next.provisioning_state = Failed;
            next.failed_provisioning_state = Some(state);
            Step::Persist(next)
        }
        (AdminUpdating, failure) => {
            next.provisioning_state = match props.last_provisioning_state {
                Some(AdminUpdating) | None => Succeeded,
                Some(previous) => previous,
            };
            next.last_provisioning_state = None;
            next.last_admin_update_error = failure.map(str::to_string);
            Step::Persist(next)
        }
        (Deleting, None) => Step::Remove,
        (Deleting, Some(_)) | (Succeeded | Failed, _) => Step::Defer,
    }
}

/// Result of one provisioning cycle, for logs and metrics
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Create or update finished
    Succeeded,
    /// Install workflow still running; resumes on a later lease
    InProgress,
    /// Create or update failed and the failure was recorded
    Failed,
    /// Admin update finished
    AdminUpdated,
    /// Admin update failed and the error was recorded
    AdminUpdateFailed,
    /// Document removed
    Deleted,
    /// Document changed state while the operation ran; nothing recorded
    Superseded,
}

impl CycleOutcome {
    /// Metric dimension value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::InProgress => "in_progress",
            Self::Failed => "failed",
            Self::AdminUpdated => "admin_updated",
            Self::AdminUpdateFailed => "admin_update_failed",
            Self::Deleted => "deleted",
            Self::Superseded => "superseded",
        }
    }
}

/// Timing knobs for a cycle
#[derive(Clone, Debug)]
pub struct CycleSettings {
    /// Deadline for the manager call
    pub operation_timeout: Option<Duration>,
    /// Delay before an unfinished install is leased again
    pub resume_delay: Duration,
    /// Delay before a failed delete is leased again
    pub delete_retry_delay: Duration,
}

impl From<&BackendConfig> for CycleSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout,
            resume_delay: config.resume_delay,
            delete_retry_delay: config.delete_retry_delay,
        }
    }
}

async fn with_deadline<F>(limit: Option<Duration>, operation: &str, fut: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(Error::operation_failed(
                operation,
                format!("timed out after {}ms", limit.as_millis()),
            ))
        }),
    }
}

fn chrono_delay(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(60))
}

/// Drive one leased document through one provisioning cycle.
///
/// Operation failures are recorded onto the document. Errors returned here
/// are plumbing failures, a lost lease, a failed delete (after it has been
/// scheduled for retry) or a protocol violation (after it has been recorded).
pub async fn run_cycle(
    documents: &ClusterDocuments,
    manager: &dyn ResourceManager,
    doc: &ClusterDocument,
    settings: &CycleSettings,
) -> Result<CycleOutcome> {
    let key = doc.key.as_str();
    let state = doc.properties.provisioning_state;

    let operation = match state {
        ProvisioningState::Creating => "create",
        ProvisioningState::Updating => "update",
        ProvisioningState::AdminUpdating => "adminUpdate",
        ProvisioningState::Deleting => "delete",
        ProvisioningState::Succeeded | ProvisioningState::Failed => {
            return Err(Error::protocol_violation(format!(
                "document {key} leased in terminal state {state}"
            )));
        }
    };

    info!(cluster = %key, state = %state, operation, "running provisioning operation");

    let result = with_deadline(settings.operation_timeout, operation, async {
        match state {
            ProvisioningState::Creating => manager.create().await,
            ProvisioningState::Updating => manager.update().await,
            ProvisioningState::AdminUpdating => manager.admin_update().await,
            _ => manager.delete().await,
        }
    })
    .await;

    let (failure, violation) = match result {
        Ok(()) => (None, None),
        Err(e @ Error::LeaseLost { .. }) => return Err(e),
        Err(e @ Error::ProtocolViolation { .. }) => (Some(e.persisted_message()), Some(e)),
        Err(e) => {
            warn!(cluster = %key, operation, error = %e, "provisioning operation failed");
            (Some(e.persisted_message()), None)
        }
    };

    if state == ProvisioningState::Deleting {
        return match failure {
            None => {
                documents.delete(key).await?;
                Ok(CycleOutcome::Deleted)
            }
            Some(message) => {
                let retry_at = Utc::now() + chrono_delay(settings.delete_retry_delay);
                documents.release_lease_until(key, retry_at).await?;
                info!(cluster = %key, retry_at = %retry_at, "delete deferred");
                Err(violation.unwrap_or_else(|| Error::operation_failed(operation, message)))
            }
        };
    }

    let resume_at = Utc::now() + chrono_delay(settings.resume_delay);
    let failure_message = failure.as_deref();
    let superseded = AtomicBool::new(false);

    let ended = documents
        .end_lease(key, &|doc| {
            if doc.properties.provisioning_state != state {
                superseded.store(true, Ordering::SeqCst);
                return Ok(());
            }
            if let Step::Persist(props) = transition(&doc.properties, failure_message) {
                if failure_message.is_none() && props.install.is_some() {
                    doc.not_before = Some(resume_at);
                }
                doc.properties = props;
            }
            Ok(())
        })
        .await?;

    let outcome = if superseded.load(Ordering::SeqCst) {
        CycleOutcome::Superseded
    } else {
        match (state, failure.is_some()) {
            (ProvisioningState::AdminUpdating, false) => CycleOutcome::AdminUpdated,
            (ProvisioningState::AdminUpdating, true) => CycleOutcome::AdminUpdateFailed,
            (_, true) => CycleOutcome::Failed,
            (_, false) if ended.properties.install.is_some() => CycleOutcome::InProgress,
            (_, false) => CycleOutcome::Succeeded,
        }
    };

    info!(
        cluster = %key,
        from = %state,
        to = %ended.properties.provisioning_state,
        outcome = outcome.as_str(),
        "provisioning cycle finished"
    );

    match violation {
        Some(v) => Err(v),
        None => Ok(outcome),
    }
}
