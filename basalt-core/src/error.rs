//! Error types for Basalt client operations.
//!
//! Following `TigerStyle`: all errors must be handled explicitly.
//! No silent failures, no ignored errors.
//!
//! The batching layer aggregates errors from several sources (tablet
//! lookups, whole-RPC failures, per-row rejections), so this type is
//! cheap to clone and carries an optional client-level error code used
//! by the session to classify retriable failures.

use std::fmt;

/// The result type for Basalt client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Client-level error codes used for session retry classification.
///
/// These codes travel alongside the error variant: the session inspects
/// them to decide whether a failed batch should be rebuilt and retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorCode {
    /// A tablet lookup failed for some operation, so the whole batch was
    /// aborted to preserve sequence ordering. The session may retry.
    AbortedBatchDueToFailedTabletLookup,

    /// An operation was admitted against one partition-list version but the
    /// resolved tablet carries another. The session may retry after a
    /// partition refresh.
    TablePartitionListVersionMismatch,

    /// The metadata cache holds a newer partition list for the table than
    /// the one the operation was built against.
    TablePartitionListStale,
}

/// Errors that can occur in Basalt client operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The operation or batch was aborted.
    Aborted {
        /// Why the abort happened.
        message: String,
        /// Optional client-level code for retry classification.
        client_code: Option<ClientErrorCode>,
    },

    /// An internal invariant was violated.
    Internal {
        /// What went wrong.
        message: String,
    },

    /// The requested entity does not exist.
    NotFound {
        /// What was being looked up.
        message: String,
    },

    /// An operation exceeded its deadline.
    TimedOut {
        /// What operation timed out.
        operation: &'static str,
    },

    /// An I/O-level failure while talking to tablet servers.
    Io {
        /// What went wrong.
        message: String,
    },

    /// Several failures with differing codes were folded into one status.
    Combined {
        /// A fixed description of the aggregate failure.
        message: &'static str,
    },

    /// The client's view of a resource is out of date.
    Stale {
        /// What is stale.
        message: String,
    },
}

impl Error {
    /// Returns the client-level error code attached to this error, if any.
    #[must_use]
    pub const fn client_code(&self) -> Option<ClientErrorCode> {
        match self {
            Self::Aborted { client_code, .. } => *client_code,
            Self::Stale { .. } => Some(ClientErrorCode::TablePartitionListStale),
            _ => None,
        }
    }

    /// Returns true if the session is entitled to retry the operations that
    /// failed with this error in a fresh batch.
    #[must_use]
    pub fn is_session_retriable(&self) -> bool {
        matches!(
            self.client_code(),
            Some(
                ClientErrorCode::AbortedBatchDueToFailedTabletLookup
                    | ClientErrorCode::TablePartitionListVersionMismatch
            )
        )
    }

    /// Returns true if this is the combined multiple-failures sentinel.
    #[must_use]
    pub const fn is_combined(&self) -> bool {
        matches!(self, Self::Combined { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted {
                message,
                client_code,
            } => match client_code {
                Some(code) => write!(f, "aborted: {message} ({code:?})"),
                None => write!(f, "aborted: {message}"),
            },
            Self::Internal { message } => write!(f, "internal error: {message}"),
            Self::NotFound { message } => write!(f, "not found: {message}"),
            Self::TimedOut { operation } => write!(f, "timed out: {operation}"),
            Self::Io { message } => write!(f, "io error: {message}"),
            Self::Combined { message } => write!(f, "combined: {message}"),
            Self::Stale { message } => write!(f, "stale: {message}"),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::TimedOut {
            operation: "tablet lookup",
        };
        assert_eq!(format!("{err}"), "timed out: tablet lookup");
    }

    #[test]
    fn test_aborted_display_with_code() {
        let err = Error::Aborted {
            message: "batch aborted".to_string(),
            client_code: Some(ClientErrorCode::AbortedBatchDueToFailedTabletLookup),
        };
        let msg = format!("{err}");
        assert!(msg.contains("batch aborted"));
        assert!(msg.contains("AbortedBatchDueToFailedTabletLookup"));
    }

    #[test]
    fn test_retry_classification() {
        let lookup_failed = Error::Aborted {
            message: "lookup failed".to_string(),
            client_code: Some(ClientErrorCode::AbortedBatchDueToFailedTabletLookup),
        };
        assert!(lookup_failed.is_session_retriable());

        let version_mismatch = Error::Aborted {
            message: "version mismatch".to_string(),
            client_code: Some(ClientErrorCode::TablePartitionListVersionMismatch),
        };
        assert!(version_mismatch.is_session_retriable());

        let plain_abort = Error::Aborted {
            message: "batch aborted".to_string(),
            client_code: None,
        };
        assert!(!plain_abort.is_session_retriable());

        let stale = Error::Stale {
            message: "table partition list is stale".to_string(),
        };
        assert_eq!(
            stale.client_code(),
            Some(ClientErrorCode::TablePartitionListStale)
        );
        assert!(!stale.is_session_retriable());
    }

    #[test]
    fn test_combined_detection() {
        let combined = Error::Combined {
            message: "multiple failures",
        };
        assert!(combined.is_combined());
        assert!(!Error::Internal {
            message: "x".to_string()
        }
        .is_combined());
    }
}
