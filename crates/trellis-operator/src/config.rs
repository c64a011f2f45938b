//! Operator configuration

use std::time::Duration;

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so the API server closes idle watches first
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Settings shared by every controller
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Server-side timeout of each watch request, in seconds
    pub watch_timeout_secs: u32,
    /// Requeue delay after a failed reconcile
    pub error_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_timeout_secs: WATCH_TIMEOUT_SECS,
            error_requeue: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_watch_timeout_is_below_client_timeout() {
        let config = OperatorConfig::default();
        assert!(config.watch_timeout_secs < 30);
        assert_eq!(config.error_requeue, Duration::from_secs(5));
    }
}
