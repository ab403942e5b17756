//! Tombstone purging.
//!
//! Tombstones older than the retention window are removed from the local
//! store and, when a remote store is given, from the remote store too.
//! Tombstones that have not been pushed yet are never purged.

use crate::error::SyncResult;
use crate::store::{LocalStore, RemoteStore};
use possync_protocol::{Collection, TenantId, Timestamp};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A tombstone selected for purging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredTombstone {
    /// Collection.
    pub collection: Collection,
    /// Record id.
    pub id: String,
    /// Deletion time.
    pub deleted_at: Timestamp,
}

/// Outcome of a purge.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReapReport {
    /// Tombstones removed locally.
    pub purged: Vec<ExpiredTombstone>,
    /// Remote deletes that failed; they are retried on the next run.
    pub remote_failures: usize,
}

/// Lists tombstones of `collections` older than `retention` at `now`.
pub fn expired_tombstones<L: LocalStore + ?Sized>(
    local: &L,
    tenant: &TenantId,
    collections: &[Collection],
    now: Timestamp,
    retention: Duration,
) -> SyncResult<Vec<ExpiredTombstone>> {
    let cutoff = now.saturating_sub(retention);
    let mut expired = Vec::new();

    for &collection in collections {
        let dirty: HashSet<String> = local
            .list_dirty(tenant, collection)?
            .into_iter()
            .map(|r| r.id)
            .collect();

        expired.extend(
            local
                .query(tenant, collection, None)?
                .into_iter()
                .filter(|r| r.is_tombstone() && r.updated_at <= cutoff && !dirty.contains(&r.id))
                .map(|r| ExpiredTombstone {
                    collection,
                    id: r.id,
                    deleted_at: r.updated_at,
                }),
        );
    }
    Ok(expired)
}

/// Removes the given tombstones from the local store.
pub fn purge_local<L: LocalStore + ?Sized>(
    local: &L,
    tenant: &TenantId,
    expired: &[ExpiredTombstone],
) -> SyncResult<()> {
    for tombstone in expired {
        local.remove(tenant, tombstone.collection, &tombstone.id)?;
    }
    Ok(())
}

/// Purges expired tombstones locally and remotely.
///
/// A tombstone is only removed locally once its remote copy is gone, so a
/// failed remote delete is retried on the next run.
pub async fn reap<L: LocalStore, R: RemoteStore>(
    local: &L,
    remote: &R,
    tenant: &TenantId,
    collections: &[Collection],
    now: Timestamp,
    retention: Duration,
) -> SyncResult<ReapReport> {
    let expired = expired_tombstones(local, tenant, collections, now, retention)?;
    let mut report = ReapReport::default();

    for tombstone in expired {
        if let Err(err) = remote.delete(tenant, tombstone.collection, &tombstone.id).await {
            warn!(
                collection = %tombstone.collection,
                id = %tombstone.id,
                error = %err,
                "remote tombstone delete failed"
            );
            report.remote_failures += 1;
            continue;
        }
        local.remove(tenant, tombstone.collection, &tombstone.id)?;
        debug!(collection = %tombstone.collection, id = %tombstone.id, "purged tombstone");
        report.purged.push(tombstone);
    }

    if !report.purged.is_empty() {
        info!(purged = report.purged.len(), %tenant, "reaped tombstones");
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLocalStore, MemoryRemoteStore};
    use possync_protocol::{DeviceId, DomainRecord};

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn tenant() -> TenantId {
        TenantId::new("tandoor").unwrap()
    }

    fn tombstone(id: &str, at: Duration) -> DomainRecord {
        DomainRecord::tombstone(
            id,
            Collection::Orders,
            Timestamp::ZERO.saturating_add(at),
            DeviceId::new("till").unwrap(),
            1,
        )
    }

    #[test]
    fn only_old_pushed_tombstones_expire() {
        let local = MemoryLocalStore::new();
        let t = tenant();
        local.upsert(&t, tombstone("old", DAY)).unwrap();
        local.upsert(&t, tombstone("recent", DAY * 20)).unwrap();
        local.upsert(&t, tombstone("unpushed", DAY)).unwrap();
        local.mark_dirty(&t, Collection::Orders, "unpushed").unwrap();

        let now = Timestamp::ZERO.saturating_add(DAY * 35);
        let expired = expired_tombstones(&local, &t, &[Collection::Orders], now, DAY * 30).unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "old");

        purge_local(&local, &t, &expired).unwrap();
        assert!(local.get(&t, Collection::Orders, "old").unwrap().is_none());
        assert!(local.get(&t, Collection::Orders, "recent").unwrap().is_some());
    }

    #[tokio::test]
    async fn reap_deletes_remote_copies() {
        let local = MemoryLocalStore::new();
        let remote = MemoryRemoteStore::new();
        let t = tenant();
        let old = tombstone("old", DAY);
        local.upsert(&t, old.clone()).unwrap();
        remote.seed(&t, Collection::Orders, old.to_document());

        let now = Timestamp::ZERO.saturating_add(DAY * 31);
        let report = reap(&local, &remote, &t, &[Collection::Orders], now, DAY * 30)
            .await
            .unwrap();
        assert_eq!(report.purged.len(), 1);
        assert_eq!(remote.document_count(&t, Collection::Orders), 0);
    }

    #[tokio::test]
    async fn offline_remote_keeps_local_tombstone() {
        let local = MemoryLocalStore::new();
        let remote = MemoryRemoteStore::new();
        remote.set_connected(false);
        let t = tenant();
        local.upsert(&t, tombstone("old", DAY)).unwrap();

        let now = Timestamp::ZERO.saturating_add(DAY * 31);
        let report = reap(&local, &remote, &t, &[Collection::Orders], now, DAY * 30)
            .await
            .unwrap();
        assert!(report.purged.is_empty());
        assert_eq!(report.remote_failures, 1);
        assert!(local.get(&t, Collection::Orders, "old").unwrap().is_some());
    }
}
