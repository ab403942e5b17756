//! # possync Engine
//!
//! Offline-first sync engine for restaurant point-of-sale devices.
//!
//! This crate provides:
//! - Local and remote store abstractions, with in-memory implementations
//! - Change tracking (dirty records, remote deltas, checkpoints)
//! - The sync state machine with smart, comprehensive and manual passes
//! - Real-time listeners that apply remote changes as they happen
//! - Device presence via heartbeats
//! - Tombstone purging
//! - Menu cleanup, export and restore
//!
//! ## Architecture
//!
//! Every device keeps a full copy of its tenant's data in a local store and
//! keeps working while offline. Local edits are staged as dirty records with
//! a provisional timestamp. Sync passes pull remote changes first, resolve
//! each record with last-write-wins, then push dirty records; the remote
//! store stamps every write with its own clock.
//!
//! ## Key Invariants
//!
//! - Pull always happens before push
//! - The greatest version wins regardless of arrival order
//! - Checkpoints only move forward, and only to pulled timestamps
//! - Background tasks never surface errors; they log and publish events
//! - Record data only ever flows through the local store

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod applier;
mod config;
mod engine;
mod error;
mod memory;
mod menu;
mod presence;
mod reaper;
mod state;
mod store;
mod tracker;

pub use applier::{ApplyOutcome, RecordApplier};
pub use config::{RetryConfig, SyncConfig};
pub use engine::SyncEngine;
pub use error::{ErrorKind, SyncError, SyncResult};
pub use memory::{CollectionSummary, MemoryLocalStore, MemoryRemoteStore, TenantSummary};
pub use menu::{
    apply_menu_cleanup, export_menu, plan_menu_cleanup, restore_menu, MenuBackup, MenuCleanup,
    MenuEntry, RestoreReport, MENU_BACKUP_VERSION,
};
pub use presence::PresenceRegistry;
pub use reaper::{expired_tombstones, purge_local, reap, ExpiredTombstone, ReapReport};
pub use state::{
    StartupReport, SyncEvent, SyncFailure, SyncReport, SyncState, SyncStats, SyncStatus,
    SyncStrategy,
};
pub use store::{
    ChangeStream, LocalStore, RemoteError, RemoteResult, RemoteStore, StoreError, StoreResult,
};
pub use tracker::{stage_delete, stage_upsert, ChangeTracker, RemoteDelta};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
