//! Sync engine state machine, reports and events.

use crate::error::{ErrorKind, SyncError};
use possync_protocol::{Collection, DeviceId, Timestamp};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// No tenant session.
    Disconnected,
    /// Opening a tenant session.
    Connecting,
    /// Connected, no sync pass running.
    Idle,
    /// A sync pass is running.
    Syncing,
    /// The last operation failed.
    Error,
}

impl SyncState {
    /// Returns true if the engine is in an active sync state.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Connecting | SyncState::Syncing)
    }

    /// Returns true if the engine can start a new sync pass.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Error)
    }

    /// Returns true if moving from `self` to `to` is allowed.
    ///
    /// Any state may return to `Disconnected`. `Error` may only go back to
    /// `Syncing` (a retry) or `Disconnected` (a reset).
    pub fn can_transition_to(&self, to: SyncState) -> bool {
        use SyncState::*;
        match (self, to) {
            (_, Disconnected) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Idle | Error) => true,
            (Idle, Syncing | Error) => true,
            (Syncing, Idle | Error) => true,
            (Error, Syncing) => true,
            _ => false,
        }
    }

    /// Checks a transition, naming both ends on failure.
    pub fn check_transition(&self, to: SyncState) -> Result<(), SyncError> {
        if self.can_transition_to(to) {
            Ok(())
        } else {
            Err(SyncError::InvalidStateTransition {
                from: self.to_string(),
                to: to.to_string(),
            })
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Disconnected => "disconnected",
            SyncState::Connecting => "connecting",
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Error => "error",
        };
        f.write_str(name)
    }
}

/// The sync pass strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Delta pull since the checkpoint, then push.
    SmartTimeBased,
    /// Full pull of every collection, no push.
    Comprehensive,
    /// Push everything dirty, then full pull, with retries.
    Manual,
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStrategy::SmartTimeBased => "smart",
            SyncStrategy::Comprehensive => "comprehensive",
            SyncStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

/// Why a pass stopped early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    /// Error class.
    #[serde(skip)]
    pub kind: ErrorKind,
    /// Error message.
    pub message: String,
}

impl From<&SyncError> for SyncFailure {
    fn from(err: &SyncError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result of one sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    /// Strategy that produced the report.
    pub strategy: SyncStrategy,
    /// Documents received from the remote store.
    pub pulled: usize,
    /// Incoming records that replaced local ones.
    pub applied: usize,
    /// Incoming records identical to local ones.
    pub unchanged: usize,
    /// Incoming records older than local ones.
    pub stale: usize,
    /// Local records pushed.
    pub pushed: usize,
    /// Documents skipped for missing required fields.
    pub skipped: usize,
    /// Records that failed to convert, apply or push.
    pub failed: usize,
    /// Checkpoints after the pass.
    pub checkpoints: Vec<(Collection, Timestamp)>,
    /// Set if the pass was aborted.
    pub failure: Option<SyncFailure>,
    /// Wall time of the pass.
    #[serde(skip)]
    pub duration: Duration,
}

impl SyncReport {
    /// Creates an empty report.
    pub fn new(strategy: SyncStrategy) -> Self {
        Self {
            strategy,
            pulled: 0,
            applied: 0,
            unchanged: 0,
            stale: 0,
            pushed: 0,
            skipped: 0,
            failed: 0,
            checkpoints: Vec::new(),
            failure: None,
            duration: Duration::ZERO,
        }
    }

    /// Records converted and resolved, whatever the resolution.
    pub fn synced(&self) -> usize {
        self.applied + self.unchanged + self.stale
    }

    /// Returns true if the pass ran to completion.
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Returns true if the pass aborted or any record failed.
    ///
    /// Skipped documents are not failures.
    pub fn has_failures(&self) -> bool {
        self.failure.is_some() || self.failed > 0
    }

    pub(crate) fn aborted(strategy: SyncStrategy, err: &SyncError) -> Self {
        let mut report = Self::new(strategy);
        report.failure = Some(SyncFailure::from(err));
        report
    }

    pub(crate) fn finish(&mut self, started: Instant) {
        self.duration = started.elapsed();
    }
}

/// Result of the startup sequence.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    /// Full pull of every collection.
    pub comprehensive: SyncReport,
    /// Delta sync that pushed offline edits.
    pub smart: SyncReport,
    /// Fallback manual sync, run only if a pass above had failures.
    pub manual: Option<SyncReport>,
}

/// Snapshot of the engine status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Current state.
    pub state: SyncState,
    /// Server time of the last successful pass, or of the newest pulled record.
    pub last_sync_time: Option<Timestamp>,
    /// Records waiting to be pushed.
    pub pending_change_count: usize,
    /// Sync is paused until re-initialization.
    pub paused: bool,
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sync passes completed without abort.
    pub passes_completed: u64,
    /// Sync passes aborted.
    pub passes_failed: u64,
    /// Documents pulled.
    pub records_pulled: u64,
    /// Records pushed.
    pub records_pushed: u64,
    /// Incoming records older than the local version.
    pub stale_records: u64,
    /// Records applied from listeners.
    pub listener_applied: u64,
    /// Retries of manual syncs.
    pub retries: u64,
    /// Completion time of the last successful pass.
    pub last_success: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Notifications published by the engine.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The state changed.
    StateChanged {
        /// Previous state.
        from: SyncState,
        /// New state.
        to: SyncState,
    },
    /// A sync pass finished.
    SyncCompleted(SyncReport),
    /// A sync pass or background task failed.
    SyncFailed {
        /// Strategy, if the failure happened in a pass.
        strategy: Option<SyncStrategy>,
        /// Failure.
        failure: SyncFailure,
    },
    /// A listener applied a remote change.
    RecordChanged {
        /// Collection.
        collection: Collection,
        /// Record id.
        id: String,
        /// The change was a delete.
        deleted: bool,
    },
    /// Credentials expired; the user must sign in again.
    ReauthenticationRequired,
    /// The set of active devices changed.
    ActiveDevicesChanged(Vec<DeviceId>),
}
