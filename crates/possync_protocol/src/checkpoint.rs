//! Per-collection sync checkpoints.

use crate::types::{Collection, TenantId, Timestamp};
use serde::{Deserialize, Serialize};

/// The last-synced cursor of one collection of one tenant.
///
/// # Invariants
///
/// - `last_synced_at` only ever moves forward
/// - It only holds server timestamps of records actually pulled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    /// Tenant.
    pub tenant: TenantId,
    /// Collection.
    pub collection: Collection,
    /// Highest server timestamp pulled so far.
    pub last_synced_at: Timestamp,
}

impl SyncCheckpoint {
    /// Creates a checkpoint that has never synced.
    pub fn new(tenant: TenantId, collection: Collection) -> Self {
        Self {
            tenant,
            collection,
            last_synced_at: Timestamp::ZERO,
        }
    }

    /// Advances to `timestamp` if it is newer.
    ///
    /// Returns true if the checkpoint moved.
    pub fn advance(&mut self, timestamp: Timestamp) -> bool {
        if timestamp > self.last_synced_at {
            self.last_synced_at = timestamp;
            true
        } else {
            false
        }
    }
}
