//! Error types surfaced at the storage engine boundary
//!
//! Local-policy failures happen before any network effect; network
//! failures never undo local writes. Every public operation returns one
//! of the kinds below, so callers can branch without string matching.

use crate::types::StorageSpace;
use lib_peer::PeerId;

/// Errors surfaced by the storage engine and the overlay DHT.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage engine is disabled")]
    Disabled,

    #[error("value of {size} bytes exceeds the {max} byte limit")]
    ValueTooLarge { size: usize, max: usize },

    #[error("key '{key}' already exists in the {existing} space")]
    DuplicateKeyInOtherSpace {
        key: String,
        existing: StorageSpace,
    },

    #[error("access denied for key '{0}'")]
    AccessDenied(String),

    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("no replica reachable for key '{0}'")]
    DhtUnavailable(String),

    #[error("write quorum failed: {acked} of {required} replicas acknowledged")]
    QuorumFailed { acked: usize, required: usize },

    #[error("operation timed out after {0} ms")]
    Timeout(u64),

    #[error("crypto capability unavailable")]
    CryptoUnavailable,

    #[error("invalid payload from {from}: {reason}")]
    InvalidPayload { from: PeerId, reason: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_name_the_key() {
        let err = StorageError::DuplicateKeyInOtherSpace {
            key: "name".into(),
            existing: StorageSpace::Private,
        };
        assert!(err.to_string().contains("name"));
        assert!(err.to_string().contains("private"));
    }

    #[test]
    fn test_quorum_failed_reports_counts() {
        let err = StorageError::QuorumFailed {
            acked: 1,
            required: 3,
        };
        assert_eq!(
            err.to_string(),
            "write quorum failed: 1 of 3 replicas acknowledged"
        );
    }
}
