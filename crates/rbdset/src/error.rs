//! Layer store error types

use std::path::PathBuf;
use thiserror::Error;

/// Layer store error
#[derive(Error, Debug)]
pub enum RbdError {
    /// Unknown device id
    #[error("device not found: {0}")]
    NotFound(String),

    /// Device id already registered
    #[error("device already exists: {0}")]
    AlreadyExists(String),

    /// Device (or backing image) still has dependent children
    #[error("device {id} has {count} dependent child layer(s)")]
    HasChildren { id: String, count: usize },

    /// Device is mounted somewhere other than the requested target
    #[error("device {id} is mounted at {current:?}, cannot mount at {requested:?}")]
    MountConflict {
        id: String,
        current: PathBuf,
        requested: PathBuf,
    },

    /// Block-storage cluster unreachable
    #[error("backend unavailable during {op} on {target}: {reason}")]
    BackendUnavailable {
        op: &'static str,
        target: String,
        transient: bool,
        reason: String,
    },

    /// Any other failure reported by the block-storage backend
    #[error("backend error during {op} on {target}: {reason}")]
    Backend {
        op: &'static str,
        target: String,
        reason: String,
    },

    /// Local mount/unmount/format/filesystem failure
    #[error("I/O error during {op} on {target}: {source}")]
    Io {
        op: &'static str,
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Operation attempted after shutdown
    #[error("device set is closed")]
    Closed,

    /// Metadata store missing and initialization not requested
    #[error("device set not initialized at {0:?}")]
    NotInitialized(PathBuf),

    /// Rejected configuration option
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Layer id unusable as an image name
    #[error("invalid layer id: {0:?}")]
    InvalidId(String),

    /// Metadata store failure
    #[error("metadata store error: {0}")]
    Metadata(String),

    /// Shutdown completed but some devices could not be released
    #[error("shutdown left {} device(s) mounted: {}", .0.len(), format_failures(.0))]
    ShutdownIncomplete(Vec<(String, String)>),
}

impl RbdError {
    pub(crate) fn io(op: &'static str, target: impl ToString, source: std::io::Error) -> Self {
        Self::Io {
            op,
            target: target.to_string(),
            source,
        }
    }

    pub(crate) fn backend(op: &'static str, target: impl ToString, reason: impl ToString) -> Self {
        Self::Backend {
            op,
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable {
                transient: true,
                ..
            }
        )
    }
}

fn format_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(id, reason)| format!("{id}: {reason}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<redb::DatabaseError> for RbdError {
    fn from(e: redb::DatabaseError) -> Self {
        Self::Metadata(e.to_string())
    }
}

impl From<redb::TransactionError> for RbdError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Metadata(e.to_string())
    }
}

impl From<redb::TableError> for RbdError {
    fn from(e: redb::TableError) -> Self {
        Self::Metadata(e.to_string())
    }
}

impl From<redb::StorageError> for RbdError {
    fn from(e: redb::StorageError) -> Self {
        Self::Metadata(e.to_string())
    }
}

impl From<redb::CommitError> for RbdError {
    fn from(e: redb::CommitError) -> Self {
        Self::Metadata(e.to_string())
    }
}

impl From<serde_json::Error> for RbdError {
    fn from(e: serde_json::Error) -> Self {
        Self::Metadata(e.to_string())
    }
}

/// Result type for layer store operations
pub type RbdResult<T> = Result<T, RbdError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let transient = RbdError::BackendUnavailable {
            op: "create",
            target: "rbd/layer_a".to_string(),
            transient: true,
            reason: "timed out".to_string(),
        };
        assert!(transient.is_transient());

        let fatal = RbdError::BackendUnavailable {
            op: "create",
            target: "rbd/layer_a".to_string(),
            transient: false,
            reason: "rbd not installed".to_string(),
        };
        assert!(!fatal.is_transient());
        assert!(!RbdError::Closed.is_transient());
    }

    #[test]
    fn test_shutdown_incomplete_message() {
        let err = RbdError::ShutdownIncomplete(vec![
            ("x".to_string(), "busy".to_string()),
            ("y".to_string(), "gone".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "shutdown left 2 device(s) mounted: x: busy; y: gone"
        );
    }
}
