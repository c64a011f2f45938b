//! Dispatcher configuration

use std::time::Duration;

use trellis_common::retry::RetryConfig;
use trellis_common::{Error, Result};

/// Tunables for a [`Backend`](crate::Backend) instance
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Identity written into leases; unique per dispatcher
    pub identity: String,
    /// Maximum concurrently running workers
    pub max_workers: usize,
    /// Lifetime of a document lease
    pub lease_duration: Duration,
    /// How often a worker renews its lease
    pub heartbeat_interval: Duration,
    /// Idle sleep between dispatch attempts
    pub poll_interval: Duration,
    /// Deadline for a single resource manager call
    pub operation_timeout: Option<Duration>,
    /// Delay before a failed delete is leased again
    pub delete_retry_delay: Duration,
    /// Delay before an unfinished install is leased again
    pub resume_delay: Duration,
    /// Backoff for lost optimistic-concurrency races
    pub conflict_retry: RetryConfig,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            identity: format!("trellis-backend-{}", uuid::Uuid::new_v4()),
            max_workers: 10,
            lease_duration: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            operation_timeout: None,
            delete_retry_delay: Duration::from_secs(30),
            resume_delay: Duration::from_secs(10),
            conflict_retry: RetryConfig::conflicts(),
        }
    }
}

impl BackendConfig {
    /// Reject settings under which leases could expire while held
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::validation_for_field("identity", "must not be empty"));
        }
        if self.max_workers == 0 {
            return Err(Error::validation_for_field("maxWorkers", "must be at least 1"));
        }
        if self.heartbeat_interval >= self.lease_duration {
            return Err(Error::validation_for_field(
                "heartbeatInterval",
                format!(
                    "heartbeat {:?} must be shorter than lease {:?}",
                    self.heartbeat_interval, self.lease_duration
                ),
            ));
        }
        Ok(())
    }
}
