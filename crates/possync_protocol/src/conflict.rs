//! Last-write-wins conflict resolution.
//!
//! Versions are totally ordered by [`RecordVersion`]: higher server
//! timestamp first, then tombstone over update, then origin device id, then
//! per-device sequence. Because the order is total, applying any set of
//! versions in any order converges on the same winner.

use crate::record::DomainRecord;
use crate::types::{Collection, Timestamp};
use thiserror::Error;

/// Outcome of comparing an incoming version against the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The incoming record replaces the stored one.
    AcceptIncoming,
    /// The stored record is newer; the incoming one is stale.
    KeepLocal,
    /// Both are the same version.
    Unchanged,
}

/// The incoming record cannot be ordered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictApplyError {
    /// The incoming record carries no usable server timestamp.
    #[error("record {id} in {collection} has invalid timestamp {timestamp}")]
    InvalidTimestamp {
        /// Collection.
        collection: Collection,
        /// Record id.
        id: String,
        /// The offending timestamp.
        timestamp: Timestamp,
    },
}

/// Decides whether `incoming` replaces `local`.
///
/// Merges are whole-record: the winner replaces the loser entirely.
pub fn resolve(
    local: Option<&DomainRecord>,
    incoming: &DomainRecord,
) -> Result<Resolution, ConflictApplyError> {
    if !incoming.updated_at.is_valid() {
        return Err(ConflictApplyError::InvalidTimestamp {
            collection: incoming.collection,
            id: incoming.id.clone(),
            timestamp: incoming.updated_at,
        });
    }

    let Some(local) = local else {
        return Ok(Resolution::AcceptIncoming);
    };

    Ok(match incoming.version().cmp(&local.version()) {
        std::cmp::Ordering::Greater => Resolution::AcceptIncoming,
        std::cmp::Ordering::Less => Resolution::KeepLocal,
        std::cmp::Ordering::Equal => Resolution::Unchanged,
    })
}
