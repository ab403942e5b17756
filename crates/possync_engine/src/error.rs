//! Error types for the sync engine.

use crate::store::{RemoteError, StoreError};
use possync_protocol::{ConflictApplyError, ConversionError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The remote store is unreachable.
    #[error("remote store unreachable: {0}")]
    Connectivity(String),

    /// The remote store refused a single write.
    #[error("remote store rejected {id}: {reason}")]
    Rejected {
        /// Record id.
        id: String,
        /// Reason given by the remote store.
        reason: String,
    },

    /// A remote document could not be converted.
    #[error("record conversion failed: {0}")]
    RecordConversion(#[from] ConversionError),

    /// An incoming record could not be ordered against the stored one.
    #[error("conflict apply failed: {0}")]
    ConflictApply(#[from] ConflictApplyError),

    /// Remote credentials expired; sync is paused until re-initialization.
    #[error("authentication expired")]
    AuthExpired,

    /// The local store is unusable; the engine requires re-initialization.
    #[error("local store failure: {0}")]
    Fatal(#[from] StoreError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// No tenant session is connected.
    #[error("not connected to a restaurant")]
    NotConnected,

    /// The session does not belong to the requested tenant.
    #[error("invalid session: {0}")]
    InvalidSession(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A menu backup file could not be read or written.
    #[error("menu backup error: {0}")]
    Backup(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Coarse classification of sync errors, published with events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Remote unreachable.
    Connectivity,
    /// Malformed remote document.
    RecordConversion,
    /// Record without usable timestamp.
    ConflictApply,
    /// Credentials expired.
    AuthExpired,
    /// Local store corrupted.
    Fatal,
    /// Anything else (cancellation, misuse).
    Other,
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }

    /// Returns the classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Connectivity(_) => ErrorKind::Connectivity,
            SyncError::RecordConversion(_) => ErrorKind::RecordConversion,
            SyncError::ConflictApply(_) => ErrorKind::ConflictApply,
            SyncError::AuthExpired => ErrorKind::AuthExpired,
            SyncError::Fatal(_) => ErrorKind::Fatal,
            SyncError::Rejected { .. }
            | SyncError::Cancelled
            | SyncError::NotConnected
            | SyncError::InvalidSession(_)
            | SyncError::Config(_)
            | SyncError::Backup(_)
            | SyncError::InvalidStateTransition { .. } => ErrorKind::Other,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(message) => SyncError::Connectivity(message),
            RemoteError::AuthExpired => SyncError::AuthExpired,
            RemoteError::Rejected { id, reason } => SyncError::Rejected { id, reason },
        }
    }
}
