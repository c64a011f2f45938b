//! Error types for Trellis
//!
//! Errors carry enough structure for callers to decide between retrying,
//! persisting the failure onto a document, or surfacing it to the runtime.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// HTTP status a provider uses to signal throttling
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Shortest requeue delay a throttling signal can produce
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Main error type for Trellis operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The requested object does not exist
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind of object looked up (e.g. "ClusterDocument", "Cluster")
        kind: String,
        /// Name or key of the object
        name: String,
    },

    /// Another writer changed the document since it was read
    #[error("concurrency conflict on {key}")]
    ConcurrencyConflict {
        /// Document key
        key: String,
    },

    /// A document with the same key already exists
    #[error("document {key} already exists")]
    AlreadyExists {
        /// Document key
        key: String,
    },

    /// The caller no longer holds the lease on a document
    #[error("lease on {key} lost by {owner}")]
    LeaseLost {
        /// Document key
        key: String,
        /// Lease owner that expected to hold it
        owner: String,
    },

    /// A provider throttled the request and supplied a retry hint
    #[error("rate limited, retry after {}s: {message}", .retry_after.as_secs())]
    RateLimited {
        /// Delay requested by the provider
        retry_after: Duration,
        /// Provider message
        message: String,
    },

    /// Raw error response from a provider API
    #[error("provider responded {status}: {message}")]
    ProviderResponse {
        /// HTTP status code
        status: u16,
        /// Value of the Retry-After header, if any
        retry_after: Option<String>,
        /// Provider message
        message: String,
    },

    /// A resource manager operation failed
    #[error("{operation} failed: {message}")]
    OperationFailed {
        /// Operation name (create, update, adminUpdate, delete, or a phase)
        operation: String,
        /// Failure message as reported by the collaborator
        message: String,
    },

    /// Persisted data and code disagree (e.g. an unknown install phase)
    #[error("protocol violation: {message}")]
    ProtocolViolation {
        /// Description of the mismatch
        message: String,
    },

    /// Validation error for configuration or documents
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path, if known
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "dispatcher", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for an object kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a concurrency conflict for a document key
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::ConcurrencyConflict { key: key.into() }
    }

    /// Create an already-exists error for a document key
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Create a lease-lost error
    pub fn lease_lost(key: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::LeaseLost {
            key: key.into(),
            owner: owner.into(),
        }
    }

    /// Create a rate-limit error with an explicit delay
    pub fn rate_limited(retry_after: Duration, msg: impl Into<String>) -> Self {
        Self::RateLimited {
            retry_after,
            message: msg.into(),
        }
    }

    /// Create a provider response error
    pub fn provider_response(
        status: u16,
        retry_after: Option<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ProviderResponse {
            status,
            retry_after,
            message: msg.into(),
        }
    }

    /// Create an operation failure
    pub fn operation_failed(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a protocol violation
    pub fn protocol_violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// True for a lost optimistic-concurrency race
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConcurrencyConflict { .. })
    }

    /// True when the object does not exist, including a kube 404
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            _ => false,
        }
    }

    /// Decode a provider throttling signal into a requeue delay
    ///
    /// Only a 429 response whose Retry-After header is a whole number of
    /// seconds counts; anything else is an ordinary failure. The delay is
    /// never shorter than [`MIN_RETRY_AFTER`].
    pub fn rate_limit_delay(&self) -> Option<Duration> {
        let delay = match self {
            Error::RateLimited { retry_after, .. } => Some(*retry_after),
            Error::ProviderResponse {
                status,
                retry_after: Some(header),
                ..
            } if *status == TOO_MANY_REQUESTS => header
                .trim()
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs),
            _ => None,
        };
        delay.map(|d| d.max(MIN_RETRY_AFTER))
    }

    /// Message to persist onto a document for operator visibility
    ///
    /// Operation failures persist the collaborator's own message; other
    /// errors persist their display form.
    pub fn persisted_message(&self) -> String {
        match self {
            Error::OperationFailed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Protocol violations, validation and serialization errors need a code
    /// or data fix. Lost leases are not retried by the holder.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
            ),
            Error::NotFound { .. } => false,
            Error::ConcurrencyConflict { .. } => true,
            Error::AlreadyExists { .. } => false,
            Error::LeaseLost { .. } => false,
            Error::RateLimited { .. } => true,
            Error::ProviderResponse { status, .. } => *status == TOO_MANY_REQUESTS || *status >= 500,
            Error::OperationFailed { .. } => true,
            Error::ProtocolViolation { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
