//! Change tracking: local deltas, remote deltas and checkpoints.
//!
//! Local edits made through [`ChangeTracker::stage_upsert`] and
//! [`ChangeTracker::stage_delete`] are written to the local store with a
//! provisional timestamp one tick above the highest version seen for that
//! record, and flagged dirty. The provisional timestamp is replaced by the
//! server timestamp once the record is pushed.

use crate::error::SyncResult;
use crate::store::{LocalStore, RemoteStore};
use possync_protocol::{
    Collection, ConversionError, DeviceId, DomainRecord, RecordPayload, SyncCheckpoint, TenantId,
    Timestamp,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Converted remote documents of one collection.
#[derive(Debug, Default)]
pub struct RemoteDelta {
    /// Successfully converted records, in server order.
    pub records: Vec<DomainRecord>,
    /// Ids of documents lacking required fields.
    pub skipped: Vec<String>,
    /// Documents that could not be converted.
    pub failed: Vec<ConversionError>,
}

impl RemoteDelta {
    /// Highest timestamp among converted records.
    pub fn max_updated_at(&self) -> Option<Timestamp> {
        self.records
            .iter()
            .map(|r| r.updated_at)
            .filter(Timestamp::is_valid)
            .max()
    }

    /// Total number of documents received.
    pub fn pulled(&self) -> usize {
        self.records.len() + self.skipped.len() + self.failed.len()
    }
}

/// Tracks what changed locally and remotely.
pub struct ChangeTracker<L, R> {
    local: Arc<L>,
    remote: Arc<R>,
    device_id: DeviceId,
}

impl<L: LocalStore, R: RemoteStore> ChangeTracker<L, R> {
    /// Creates a tracker writing local edits as `device_id`.
    pub fn new(local: Arc<L>, remote: Arc<R>, device_id: DeviceId) -> Self {
        Self {
            local,
            remote,
            device_id,
        }
    }

    /// Local records not yet pushed.
    pub fn compute_local_delta(
        &self,
        tenant: &TenantId,
        collection: Collection,
    ) -> SyncResult<Vec<DomainRecord>> {
        let mut dirty = self.local.list_dirty(tenant, collection)?;
        dirty.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(dirty)
    }

    /// Remote documents changed at or after `since`, converted.
    ///
    /// With `since == None` every document is fetched. Documents that fail
    /// conversion are logged and reported, never returned as records.
    pub async fn compute_remote_delta(
        &self,
        tenant: &TenantId,
        collection: Collection,
        since: Option<Timestamp>,
    ) -> SyncResult<RemoteDelta> {
        let documents = self.remote.query(tenant, collection, since).await?;
        let mut delta = RemoteDelta::default();

        for doc in &documents {
            match DomainRecord::from_document(collection, doc) {
                Ok(record) => delta.records.push(record),
                Err(err) if err.is_skippable() => {
                    debug!(%collection, id = %doc.id, error = %err, "skipping incomplete document");
                    delta.skipped.push(doc.id.clone());
                }
                Err(err) => {
                    warn!(%collection, id = %doc.id, error = %err, "failed to convert document");
                    delta.failed.push(err);
                }
            }
        }

        debug!(
            %collection,
            since = ?since,
            converted = delta.records.len(),
            skipped = delta.skipped.len(),
            failed = delta.failed.len(),
            "computed remote delta"
        );
        Ok(delta)
    }

    /// The stored checkpoint of a collection.
    pub fn checkpoint(&self, tenant: &TenantId, collection: Collection) -> SyncResult<SyncCheckpoint> {
        let mut checkpoint = SyncCheckpoint::new(tenant.clone(), collection);
        checkpoint.advance(self.local.checkpoint(tenant, collection)?);
        Ok(checkpoint)
    }

    /// Moves the checkpoint forward to `timestamp`; older values are ignored.
    pub fn advance_checkpoint(
        &self,
        tenant: &TenantId,
        collection: Collection,
        timestamp: Timestamp,
    ) -> SyncResult<SyncCheckpoint> {
        let mut checkpoint = self.checkpoint(tenant, collection)?;
        if checkpoint.advance(timestamp) {
            self.local.save_checkpoint(tenant, collection, timestamp)?;
            debug!(%collection, checkpoint = %timestamp, "advanced checkpoint");
        }
        Ok(checkpoint)
    }

    /// Records a local create or update.
    pub fn stage_upsert(
        &self,
        tenant: &TenantId,
        id: impl Into<String>,
        payload: RecordPayload,
    ) -> SyncResult<DomainRecord> {
        stage_upsert(self.local.as_ref(), &self.device_id, tenant, id.into(), payload)
    }

    /// Records a local delete as a tombstone.
    ///
    /// Returns `None` if the record does not exist or is already deleted.
    pub fn stage_delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: &str,
    ) -> SyncResult<Option<DomainRecord>> {
        stage_delete(self.local.as_ref(), &self.device_id, tenant, collection, id)
    }

    /// Number of records waiting to be pushed.
    pub fn pending_count(&self, tenant: &TenantId) -> SyncResult<usize> {
        Ok(self.local.dirty_count(tenant)?)
    }
}

/// Writes a dirty local edit of `id` produced by `device_id`.
///
/// The edit gets the provisional timestamp `base + 1`, where `base` is the
/// stored version's timestamp.
pub fn stage_upsert<L: LocalStore + ?Sized>(
    local: &L,
    device_id: &DeviceId,
    tenant: &TenantId,
    id: String,
    payload: RecordPayload,
) -> SyncResult<DomainRecord> {
    let collection = payload.collection();
    loop {
        let existing = local.get(tenant, collection, &id)?;
        let base = existing.as_ref().map_or(Timestamp::ZERO, |r| r.updated_at);
        let sequence = local.next_sequence(tenant)?;
        let record = DomainRecord::new(
            id.clone(),
            payload.clone(),
            base.next(),
            device_id.clone(),
            sequence,
        );
        let expected = existing.as_ref().map(DomainRecord::version);
        if local.compare_and_upsert(tenant, expected.as_ref(), record.clone(), true)? {
            debug!(%collection, %id, sequence, "staged local upsert");
            return Ok(record);
        }
    }
}

/// Replaces a live record with a dirty tombstone produced by `device_id`.
pub fn stage_delete<L: LocalStore + ?Sized>(
    local: &L,
    device_id: &DeviceId,
    tenant: &TenantId,
    collection: Collection,
    id: &str,
) -> SyncResult<Option<DomainRecord>> {
    loop {
        let Some(existing) = local.get(tenant, collection, id)? else {
            return Ok(None);
        };
        if existing.is_tombstone() {
            return Ok(None);
        }
        let sequence = local.next_sequence(tenant)?;
        let mut tombstone = DomainRecord::tombstone(
            id,
            collection,
            existing.updated_at.next(),
            device_id.clone(),
            sequence,
        );
        tombstone.payload = existing.payload.clone();
        if local.compare_and_upsert(tenant, Some(&existing.version()), tombstone.clone(), true)? {
            debug!(%collection, %id, sequence, "staged local delete");
            return Ok(Some(tombstone));
        }
    }
}
