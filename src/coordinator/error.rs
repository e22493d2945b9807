//! Error types for the coordinator.
//!
//! Defines custom error types with classification for retry behavior.
//! Timeout errors carry the last observed state and a guest kernel log
//! snapshot so callers can do postmortems without re-querying the guest.

use std::time::Duration;

use thiserror::Error;

use crate::guest::GuestError;

/// Error type for coordinator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Awaited resize count was not reached within the timeout.
    /// Recoverable: the caller may retry the wait or escalate.
    #[error(
        "resize count did not reach {expected} within {timeout:?} (last observed {last_observed})"
    )]
    ResizeTimeout {
        /// The count the caller waited for.
        expected: u64,
        /// Last count read from the guest before giving up.
        last_observed: u64,
        /// Wait budget that elapsed.
        timeout: Duration,
        /// Guest kernel log captured at timeout, for postmortem.
        diagnostics: String,
    },

    /// A request failed validation. Terminal: the caller must resubmit
    /// a corrected request.
    #[error("validation rejected: {0}")]
    ValidationRejected(String),

    /// An operation's precondition is not met yet (e.g. restore against a
    /// running VM). Not fatal: the operation stays pending.
    #[error("precondition not met: {0}")]
    PreconditionNotMet(String),

    /// The caller abandoned a wait. The underlying server-side operation
    /// keeps running.
    #[error("wait cancelled by caller")]
    Cancelled,

    /// Another operation holds the per-VM lock.
    #[error("operation already in progress, held by '{current_holder}'")]
    OperationLocked { current_holder: String },

    /// Guest command channel error
    #[error("guest channel error: {0}")]
    Guest(#[from] GuestError),

    /// Capacity string could not be parsed or arithmetic overflowed
    #[error("capacity error: {0}")]
    Capacity(#[from] super::capacity::CapacityError),

    /// Missing required field in resource
    #[error("missing required field: {0}")]
    MissingField(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates a write conflict (stale resourceVersion)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on rate limiting, write conflicts and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::ResizeTimeout { .. } => true,
            Error::PreconditionNotMet(_) | Error::OperationLocked { .. } => true,
            Error::Guest(e) => e.is_retryable(),
            Error::ValidationRejected(_)
            | Error::Cancelled
            | Error::Capacity(_)
            | Error::MissingField(_)
            | Error::Serialization(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            // Pending preconditions clear quickly once the VM stops
            Error::PreconditionNotMet(_) | Error::OperationLocked { .. } => {
                Duration::from_secs(10)
            }
            _ if self.is_retryable() => Duration::from_secs(30),
            // Don't requeue aggressively for non-retryable errors
            _ => Duration::from_secs(3600),
        }
    }
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_is_terminal() {
        let err = Error::ValidationRejected(
            "target resources requests storage size is smaller than the source".to_string(),
        );
        assert!(!err.is_retryable());
        assert_eq!(err.requeue_after(), Duration::from_secs(3600));
    }

    #[test]
    fn test_precondition_requeues_quickly() {
        let err = Error::PreconditionNotMet("target VM is running".to_string());
        assert!(err.is_retryable());
        assert_eq!(err.requeue_after(), Duration::from_secs(10));
    }

    #[test]
    fn test_resize_timeout_carries_diagnostics() {
        let err = Error::ResizeTimeout {
            expected: 3,
            last_observed: 2,
            timeout: Duration::from_secs(240),
            diagnostics: "virtio_blk vda: new size stanza".to_string(),
        };
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("did not reach 3"));
        assert!(msg.contains("last observed 2"));
    }

    #[test]
    fn test_cancelled_not_retryable() {
        assert!(!Error::Cancelled.is_retryable());
    }
}
