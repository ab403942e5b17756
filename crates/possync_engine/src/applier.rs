//! Applies resolved records to the local store.
//!
//! Every write goes through [`LocalStore::compare_and_upsert`] against the
//! version read just before resolving, so a listener event and a sync pass
//! touching the same record cannot overwrite each other's result.

use crate::error::SyncResult;
use crate::store::LocalStore;
use possync_protocol::{resolve, DomainRecord, Resolution, TenantId, Timestamp};
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The incoming record replaced the stored one.
    Applied,
    /// The stored record is the same version.
    Unchanged,
    /// The stored record is newer.
    Stale,
    /// The incoming record had no usable timestamp and was stored anyway.
    RemoteDefault,
}

/// Applies incoming and pushed records to a local store.
pub struct RecordApplier<L> {
    local: Arc<L>,
}

impl<L: LocalStore> RecordApplier<L> {
    /// Creates an applier over `local`.
    pub fn new(local: Arc<L>) -> Self {
        Self { local }
    }

    /// Resolves `incoming` against the stored version and stores the winner.
    ///
    /// Records without a usable timestamp fall back to remote-wins: the
    /// payload is stored and the stored timestamp keeps its previous value.
    ///
    /// An echo of this device's own push can arrive while a later edit of
    /// the same record is still dirty. The edit then keeps its payload, is
    /// lifted above the echo's timestamp and stays dirty.
    pub fn apply_incoming(&self, tenant: &TenantId, incoming: &DomainRecord) -> SyncResult<ApplyOutcome> {
        loop {
            let current = self.local.get(tenant, incoming.collection, &incoming.id)?;
            if let Some(edit) = current.as_ref() {
                if supersedes(edit, incoming)
                    && self.local.is_dirty(tenant, edit.collection, &edit.id)?
                {
                    let mut lifted = edit.clone();
                    lifted.updated_at = incoming.updated_at.next();
                    if self
                        .local
                        .compare_and_upsert(tenant, Some(&edit.version()), lifted, true)?
                    {
                        debug!(
                            collection = %incoming.collection,
                            id = %incoming.id,
                            sequence = edit.sequence,
                            "kept newer local edit over echoed push"
                        );
                        return Ok(ApplyOutcome::Stale);
                    }
                    continue;
                }
            }

            let (record, outcome) = match resolve(current.as_ref(), incoming) {
                Ok(Resolution::AcceptIncoming) => (incoming.clone(), ApplyOutcome::Applied),
                Ok(Resolution::KeepLocal) => return Ok(ApplyOutcome::Stale),
                Ok(Resolution::Unchanged) => return Ok(ApplyOutcome::Unchanged),
                Err(err) => {
                    warn!(error = %err, "storing record without usable timestamp as remote default");
                    let mut record = incoming.clone();
                    record.updated_at = current.as_ref().map_or(Timestamp::ZERO, |r| r.updated_at);
                    if current.as_ref().map(DomainRecord::version) == Some(record.version()) {
                        return Ok(ApplyOutcome::Unchanged);
                    }
                    (record, ApplyOutcome::RemoteDefault)
                }
            };

            let expected = current.as_ref().map(DomainRecord::version);
            if self
                .local
                .compare_and_upsert(tenant, expected.as_ref(), record, false)?
            {
                debug!(
                    collection = %incoming.collection,
                    id = %incoming.id,
                    updated_at = %incoming.updated_at,
                    deleted = incoming.deleted,
                    outcome = ?outcome,
                    "applied incoming record"
                );
                return Ok(outcome);
            }
        }
    }

    /// Records that `pushed` was accepted by the server at `server_ts`.
    ///
    /// If the record was edited again while the push was in flight, the
    /// newer edit stays dirty and is lifted above `server_ts` so the pushed
    /// copy cannot win over it later. Returns true if the store changed.
    pub fn mark_pushed(
        &self,
        tenant: &TenantId,
        pushed: &DomainRecord,
        server_ts: Timestamp,
    ) -> SyncResult<bool> {
        let mut accepted = pushed.clone();
        accepted.updated_at = server_ts.max(pushed.updated_at);

        loop {
            let Some(current) = self.local.get(tenant, pushed.collection, &pushed.id)? else {
                return Ok(false);
            };

            let (next, dirty) = if current.version() == pushed.version() {
                (accepted.clone(), false)
            } else if current.origin_device_id == pushed.origin_device_id
                && current.sequence > pushed.sequence
            {
                if current.updated_at > accepted.updated_at {
                    return Ok(false);
                }
                let mut lifted = current.clone();
                lifted.updated_at = accepted.updated_at.next();
                (lifted, true)
            } else if current.version() < accepted.version() {
                (accepted.clone(), false)
            } else {
                return Ok(false);
            };

            if self
                .local
                .compare_and_upsert(tenant, Some(&current.version()), next, dirty)?
            {
                debug!(
                    collection = %pushed.collection,
                    id = %pushed.id,
                    server_ts = %server_ts,
                    still_dirty = dirty,
                    "recorded push"
                );
                return Ok(true);
            }
        }
    }
}

/// True if `local` is a later edit by the device that wrote `incoming`
/// whose provisional timestamp does not beat it.
fn supersedes(local: &DomainRecord, incoming: &DomainRecord) -> bool {
    local.origin_device_id.is_some()
        && local.origin_device_id == incoming.origin_device_id
        && local.sequence > incoming.sequence
        && incoming.updated_at.is_valid()
        && local.updated_at <= incoming.updated_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLocalStore;
    use possync_protocol::{Collection, DeviceId, RecordPayload, StaffUser};

    fn tenant() -> TenantId {
        TenantId::new("thali").unwrap()
    }

    fn user(name: &str, updated_at: i64, device: &str, sequence: u64) -> DomainRecord {
        DomainRecord::new(
            "u1",
            RecordPayload::User(StaffUser {
                name: name.into(),
                role: "server".into(),
                is_active: true,
            }),
            Timestamp::from_millis(updated_at),
            DeviceId::new(device).unwrap(),
            sequence,
        )
    }

    fn setup() -> (RecordApplier<MemoryLocalStore>, Arc<MemoryLocalStore>) {
        let local = Arc::new(MemoryLocalStore::new());
        (RecordApplier::new(Arc::clone(&local)), local)
    }

    #[test]
    fn newer_remote_replaces_dirty_local() {
        let (applier, local) = setup();
        let t = tenant();
        local.compare_and_upsert(&t, None, user("Asha", 100, "a", 1), true).unwrap();

        let remote = user("Asha K", 150, "b", 4);
        assert_eq!(applier.apply_incoming(&t, &remote).unwrap(), ApplyOutcome::Applied);
        assert_eq!(local.get(&t, Collection::Users, "u1").unwrap(), Some(remote.clone()));
        assert_eq!(local.dirty_count(&t).unwrap(), 0);

        assert_eq!(applier.apply_incoming(&t, &remote).unwrap(), ApplyOutcome::Unchanged);
        assert_eq!(
            applier.apply_incoming(&t, &user("old", 120, "b", 3)).unwrap(),
            ApplyOutcome::Stale
        );
    }

    #[test]
    fn own_echo_keeps_newer_local_edit() {
        let (applier, local) = setup();
        let t = tenant();
        let first = user("Asha", 1, "a", 1);
        local.compare_and_upsert(&t, None, first.clone(), true).unwrap();
        let second = user("Asha K", 2, "a", 2);
        local
            .compare_and_upsert(&t, Some(&first.version()), second, true)
            .unwrap();

        // the server stamped the first edit and echoed it back
        let mut echo = first.clone();
        echo.updated_at = Timestamp::from_millis(5_000);
        assert_eq!(applier.apply_incoming(&t, &echo).unwrap(), ApplyOutcome::Stale);

        let stored = local.get(&t, Collection::Users, "u1").unwrap().unwrap();
        assert_eq!(stored.sequence, 2);
        assert_eq!(stored.updated_at, Timestamp::from_millis(5_001));
        assert!(matches!(stored.payload, Some(RecordPayload::User(ref u)) if u.name == "Asha K"));
        assert_eq!(local.dirty_count(&t).unwrap(), 1);

        // the push completing afterwards leaves the edit pending
        assert!(!applier.mark_pushed(&t, &first, Timestamp::from_millis(5_000)).unwrap());
        assert_eq!(local.dirty_count(&t).unwrap(), 1);
        assert_eq!(applier.apply_incoming(&t, &echo).unwrap(), ApplyOutcome::Stale);
        assert_eq!(local.get(&t, Collection::Users, "u1").unwrap(), Some(stored));
    }

    #[test]
    fn untimed_record_keeps_previous_timestamp() {
        let (applier, local) = setup();
        let t = tenant();
        local.upsert(&t, user("Asha", 300, "a", 1)).unwrap();

        let untimed = user("Ravi", 0, "b", 2);
        assert_eq!(applier.apply_incoming(&t, &untimed).unwrap(), ApplyOutcome::RemoteDefault);

        let stored = local.get(&t, Collection::Users, "u1").unwrap().unwrap();
        assert_eq!(stored.updated_at, Timestamp::from_millis(300));
        assert!(matches!(stored.payload, Some(RecordPayload::User(ref u)) if u.name == "Ravi"));

        assert_eq!(applier.apply_incoming(&t, &untimed).unwrap(), ApplyOutcome::Unchanged);
    }

    #[test]
    fn mark_pushed_replaces_provisional_timestamp() {
        let (applier, local) = setup();
        let t = tenant();
        let staged = user("Asha", 1, "a", 1);
        local.compare_and_upsert(&t, None, staged.clone(), true).unwrap();

        assert!(applier.mark_pushed(&t, &staged, Timestamp::from_millis(5_000)).unwrap());
        let stored = local.get(&t, Collection::Users, "u1").unwrap().unwrap();
        assert_eq!(stored.updated_at, Timestamp::from_millis(5_000));
        assert_eq!(local.dirty_count(&t).unwrap(), 0);
    }

    #[test]
    fn edit_during_push_stays_dirty_and_newer() {
        let (applier, local) = setup();
        let t = tenant();
        let staged = user("Asha", 1, "a", 1);
        local.compare_and_upsert(&t, None, staged.clone(), true).unwrap();

        let edited = user("Asha R", 2, "a", 2);
        local
            .compare_and_upsert(&t, Some(&staged.version()), edited, true)
            .unwrap();

        assert!(applier.mark_pushed(&t, &staged, Timestamp::from_millis(5_000)).unwrap());
        let stored = local.get(&t, Collection::Users, "u1").unwrap().unwrap();
        assert_eq!(stored.updated_at, Timestamp::from_millis(5_001));
        assert_eq!(stored.sequence, 2);
        assert_eq!(local.dirty_count(&t).unwrap(), 1);
    }
}
