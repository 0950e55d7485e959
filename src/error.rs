//! Error types for the LVM manager
//!
//! Provides structured error types for all manager components including
//! inventory refresh, the operation guard, lifecycle operations, snapshots
//! and metadata backups.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Validation Errors (checked against a fresh inventory)
    // =========================================================================
    #[error("Device in use: {device} ({reason})")]
    DeviceInUse { device: String, reason: String },

    #[error("Invalid device: {device} is not a block device")]
    InvalidDevice { device: String },

    #[error("Resource already exists: {kind}/{name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Device is not a physical volume: {device}")]
    NotAPhysicalVolume { device: String },

    #[error("Volume group not found: {name}")]
    VolumeGroupNotFound { name: String },

    #[error("Resource not found: {kind}/{name}")]
    NotFound { kind: String, name: String },

    #[error("Insufficient capacity: requested {requested} bytes, available {available} bytes")]
    InsufficientCapacity { requested: u64, available: u64 },

    #[error("Snapshot parent not found: {parent}")]
    ParentNotFound { parent: String },

    #[error("Snapshot quota exceeded for {parent}: {current} of {limit} snapshots in use")]
    SnapshotQuotaExceeded {
        parent: String,
        current: u32,
        limit: u32,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Volume backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Backend operation failed: {operation}: {diagnostics}")]
    BackendOperationFailed {
        operation: String,
        diagnostics: String,
    },

    #[error("No filesystem resize method for {device} (filesystem: {filesystem})")]
    NoResizeMethod { device: String, filesystem: String },

    #[error("{operation} stopped at {failed}: {reason} (completed: {})", .completed.join(", "))]
    PartialFailure {
        operation: String,
        completed: Vec<String>,
        failed: String,
        reason: String,
    },

    // =========================================================================
    // Operation Guard Errors
    // =========================================================================
    #[error("Timed out after {}s waiting for the operation lock", .timeout.as_secs())]
    LockTimeout { timeout: Duration },

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    // =========================================================================
    // Backup Errors
    // =========================================================================
    #[error("Backups are disabled in configuration")]
    BackupDisabled,

    #[error("Backup archive error: {0}")]
    Archive(String),

    #[error("Backup archive IO error at {path}: {source}")]
    ArchiveIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Size parse error: {0}")]
    SizeParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure class of an error, used for audit records and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
    /// Precondition failed against inventory
    Validation,
    /// Inventory or backend could not be reached
    BackendUnavailable,
    /// Operation guard contention
    LockTimeout,
    /// Primary mutation done, follow-on or later sub-step failed
    PartialSuccess,
    /// Confirmation denied
    Cancelled,
    /// Backup specific, never fatal to the monitor loop
    Backup,
    /// Configuration, parsing and everything else
    Internal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Validation => write!(f, "validation"),
            ErrorClass::BackendUnavailable => write!(f, "backend-unavailable"),
            ErrorClass::LockTimeout => write!(f, "lock-timeout"),
            ErrorClass::PartialSuccess => write!(f, "partial-success"),
            ErrorClass::Cancelled => write!(f, "cancelled"),
            ErrorClass::Backup => write!(f, "backup"),
            ErrorClass::Internal => write!(f, "internal"),
        }
    }
}

/// Action to take on error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Skip for now, the next monitor/backup cycle tries again
    RetryNextCycle,
    /// Caller may retry after a pause
    RetryByCaller(Duration),
    /// Never retried automatically
    NoRetry,
}

impl Error {
    /// Map this error onto the failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::DeviceInUse { .. }
            | Error::InvalidDevice { .. }
            | Error::AlreadyExists { .. }
            | Error::NotAPhysicalVolume { .. }
            | Error::VolumeGroupNotFound { .. }
            | Error::NotFound { .. }
            | Error::InsufficientCapacity { .. }
            | Error::ParentNotFound { .. }
            | Error::SnapshotQuotaExceeded { .. }
            | Error::InvalidRequest(_) => ErrorClass::Validation,

            Error::BackendUnavailable { .. } | Error::BackendOperationFailed { .. } => {
                ErrorClass::BackendUnavailable
            }

            Error::LockTimeout { .. } => ErrorClass::LockTimeout,

            Error::PartialFailure { .. } | Error::NoResizeMethod { .. } => {
                ErrorClass::PartialSuccess
            }

            Error::Cancelled(_) => ErrorClass::Cancelled,

            Error::BackupDisabled | Error::Archive(_) | Error::ArchiveIo { .. } => {
                ErrorClass::Backup
            }

            Error::Internal(_)
            | Error::Io(_)
            | Error::Configuration(_)
            | Error::SizeParse(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorClass::Internal,
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self.class() {
            ErrorClass::BackendUnavailable | ErrorClass::Backup => ErrorAction::RetryNextCycle,
            ErrorClass::LockTimeout => ErrorAction::RetryByCaller(Duration::from_secs(30)),
            ErrorClass::Validation
            | ErrorClass::PartialSuccess
            | ErrorClass::Cancelled
            | ErrorClass::Internal => ErrorAction::NoRetry,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRetry)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. } | Error::LockTimeout { .. }
        )
    }

    /// Wrap an IO error raised while handling backup archives at `path`
    pub fn archive_io(path: impl AsRef<std::path::Path>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.as_ref().display().to_string();
        move |source| Error::ArchiveIo { path, source }
    }

    /// Shorthand for a backend primitive failure
    pub fn backend(operation: impl Into<String>, diagnostics: impl Into<String>) -> Self {
        Error::BackendOperationFailed {
            operation: operation.into(),
            diagnostics: diagnostics.into(),
        }
    }
}

/// Result type alias for the manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::LockTimeout {
            timeout: Duration::from_secs(300),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RetryByCaller(Duration::from_secs(30))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRetry);

        let err = Error::InsufficientCapacity {
            requested: 1000,
            available: 500,
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert_eq!(err.action(), ErrorAction::NoRetry);

        assert_eq!(Error::BackupDisabled.action(), ErrorAction::RetryNextCycle);
    }

    #[test]
    fn test_io_class_depends_on_origin() {
        let bare = Error::from(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"));
        assert_eq!(bare.class(), ErrorClass::Internal);

        let archive = Error::archive_io("/var/backups/lvm")(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert_eq!(archive.class(), ErrorClass::Backup);
        assert!(archive.to_string().contains("/var/backups/lvm"));
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackendUnavailable {
            reason: "vgs timed out".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_partial_failure_message_lists_completed_steps() {
        let err = Error::PartialFailure {
            operation: "create-pv".into(),
            completed: vec!["/dev/sdb".into(), "/dev/sdc".into()],
            failed: "/dev/sdd".into(),
            reason: "device busy".into(),
        };
        let message = err.to_string();
        assert!(message.contains("/dev/sdb, /dev/sdc"));
        assert!(message.contains("/dev/sdd"));
        assert_eq!(err.class(), ErrorClass::PartialSuccess);
    }
}
