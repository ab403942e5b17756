use crate::store::{LocalStore, StoreError, StoreResult};
use parking_lot::RwLock;
use possync_protocol::{Collection, DomainRecord, RecordVersion, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    tenants: BTreeMap<TenantId, TenantData>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TenantData {
    records: BTreeMap<Collection, BTreeMap<String, StoredRecord>>,
    checkpoints: BTreeMap<Collection, Timestamp>,
    last_sequence: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    record: DomainRecord,
    dirty: bool,
}

/// Record counts of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionSummary {
    /// Collection.
    pub collection: Collection,
    /// Live records.
    pub records: usize,
    /// Tombstones.
    pub tombstones: usize,
    /// Records not yet pushed.
    pub dirty: usize,
    /// Checkpoint.
    pub checkpoint: Timestamp,
}

/// Record counts of one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantSummary {
    /// Tenant.
    pub tenant: TenantId,
    /// Per-collection counts.
    pub collections: Vec<CollectionSummary>,
    /// Last allocated device sequence.
    pub last_sequence: u64,
}

/// An in-memory local store with optional snapshot persistence.
///
/// When opened from a path, [`flush`](Self::flush) writes the whole state
/// to that path atomically (temporary file, then rename).
#[derive(Debug)]
pub struct MemoryLocalStore {
    state: RwLock<Snapshot>,
    path: Option<PathBuf>,
    corrupted: AtomicBool,
}

impl MemoryLocalStore {
    /// Creates an empty store that is never persisted.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Snapshot {
                version: SNAPSHOT_VERSION,
                tenants: BTreeMap::new(),
            }),
            path: None,
            corrupted: AtomicBool::new(false),
        }
    }

    /// Opens the snapshot at `path`, or starts empty if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let snapshot: Snapshot = ciborium::from_reader(reader)
                .map_err(|e| StoreError::Corrupted(format!("{}: {e}", path.display())))?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(StoreError::Corrupted(format!(
                    "{}: unsupported snapshot version {}",
                    path.display(),
                    snapshot.version
                )));
            }
            snapshot
        } else {
            Snapshot {
                version: SNAPSHOT_VERSION,
                tenants: BTreeMap::new(),
            }
        };

        Ok(Self {
            state: RwLock::new(snapshot),
            path: Some(path),
            corrupted: AtomicBool::new(false),
        })
    }

    /// Returns the snapshot path, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Writes the snapshot. Does nothing for stores without a path.
    pub fn flush(&self) -> StoreResult<()> {
        self.check()?;
        let Some(path) = &self.path else {
            return Ok(());
        };

        let tmp = path.with_extension("tmp");
        {
            let state = self.state.read();
            let mut writer = BufWriter::new(File::create(&tmp)?);
            ciborium::into_writer(&*state, &mut writer)
                .map_err(|e| StoreError::Encoding(e.to_string()))?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Marks the store unusable, or usable again.
    ///
    /// While corrupted, every operation fails with [`StoreError::Corrupted`].
    pub fn set_corrupted(&self, corrupted: bool) {
        self.corrupted.store(corrupted, Ordering::SeqCst);
    }

    /// Summarizes the contents per tenant.
    pub fn summary(&self) -> Vec<TenantSummary> {
        let state = self.state.read();
        state
            .tenants
            .iter()
            .map(|(tenant, data)| {
                let mut collections: Vec<Collection> = data
                    .records
                    .keys()
                    .chain(data.checkpoints.keys())
                    .copied()
                    .collect();
                collections.sort();
                collections.dedup();

                let collections = collections
                    .into_iter()
                    .map(|collection| {
                        let records = data.records.get(&collection);
                        let count = |f: fn(&StoredRecord) -> bool| {
                            records.map_or(0, |r| r.values().filter(|s| f(s)).count())
                        };
                        CollectionSummary {
                            collection,
                            records: count(|s| !s.record.deleted),
                            tombstones: count(|s| s.record.deleted),
                            dirty: count(|s| s.dirty),
                            checkpoint: data
                                .checkpoints
                                .get(&collection)
                                .copied()
                                .unwrap_or(Timestamp::ZERO),
                        }
                    })
                    .collect();

                TenantSummary {
                    tenant: tenant.clone(),
                    collections,
                    last_sequence: data.last_sequence,
                }
            })
            .collect()
    }

    fn check(&self) -> StoreResult<()> {
        if self.corrupted.load(Ordering::SeqCst) {
            Err(StoreError::Corrupted("store marked corrupted".into()))
        } else {
            Ok(())
        }
    }

    fn read<T>(&self, tenant: &TenantId, f: impl FnOnce(Option<&TenantData>) -> T) -> StoreResult<T> {
        self.check()?;
        let state = self.state.read();
        Ok(f(state.tenants.get(tenant)))
    }

    fn write<T>(&self, tenant: &TenantId, f: impl FnOnce(&mut TenantData) -> T) -> StoreResult<T> {
        self.check()?;
        let mut state = self.state.write();
        Ok(f(state.tenants.entry(tenant.clone()).or_default()))
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: &str,
    ) -> StoreResult<Option<DomainRecord>> {
        self.read(tenant, |data| {
            data.and_then(|d| d.records.get(&collection))
                .and_then(|records| records.get(id))
                .map(|stored| stored.record.clone())
        })
    }

    fn query(
        &self,
        tenant: &TenantId,
        collection: Collection,
        since: Option<Timestamp>,
    ) -> StoreResult<Vec<DomainRecord>> {
        self.read(tenant, |data| {
            data.and_then(|d| d.records.get(&collection))
                .map(|records| {
                    records
                        .values()
                        .filter(|s| since.map_or(true, |since| s.record.updated_at >= since))
                        .map(|s| s.record.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn upsert(&self, tenant: &TenantId, record: DomainRecord) -> StoreResult<()> {
        self.write(tenant, |data| {
            let records = data.records.entry(record.collection).or_default();
            let dirty = records.get(&record.id).is_some_and(|s| s.dirty);
            records.insert(record.id.clone(), StoredRecord { record, dirty });
        })
    }

    fn compare_and_upsert(
        &self,
        tenant: &TenantId,
        expected: Option<&RecordVersion>,
        record: DomainRecord,
        dirty: bool,
    ) -> StoreResult<bool> {
        self.write(tenant, |data| {
            let records = data.records.entry(record.collection).or_default();
            let current = records.get(&record.id).map(|s| s.record.version());
            if current.as_ref() != expected {
                return false;
            }
            records.insert(record.id.clone(), StoredRecord { record, dirty });
            true
        })
    }

    fn remove(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<()> {
        self.write(tenant, |data| {
            if let Some(records) = data.records.get_mut(&collection) {
                records.remove(id);
            }
        })
    }

    fn mark_dirty(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<()> {
        self.set_dirty(tenant, collection, id, true)
    }

    fn clear_dirty(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<()> {
        self.set_dirty(tenant, collection, id, false)
    }

    fn is_dirty(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<bool> {
        self.read(tenant, |data| {
            data.and_then(|d| d.records.get(&collection))
                .and_then(|records| records.get(id))
                .is_some_and(|s| s.dirty)
        })
    }

    fn list_dirty(
        &self,
        tenant: &TenantId,
        collection: Collection,
    ) -> StoreResult<Vec<DomainRecord>> {
        self.read(tenant, |data| {
            data.and_then(|d| d.records.get(&collection))
                .map(|records| {
                    records
                        .values()
                        .filter(|s| s.dirty)
                        .map(|s| s.record.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    fn dirty_count(&self, tenant: &TenantId) -> StoreResult<usize> {
        self.read(tenant, |data| {
            data.map_or(0, |d| {
                d.records
                    .values()
                    .flat_map(BTreeMap::values)
                    .filter(|s| s.dirty)
                    .count()
            })
        })
    }

    fn checkpoint(&self, tenant: &TenantId, collection: Collection) -> StoreResult<Timestamp> {
        self.read(tenant, |data| {
            data.and_then(|d| d.checkpoints.get(&collection))
                .copied()
                .unwrap_or(Timestamp::ZERO)
        })
    }

    fn save_checkpoint(
        &self,
        tenant: &TenantId,
        collection: Collection,
        timestamp: Timestamp,
    ) -> StoreResult<()> {
        self.write(tenant, |data| {
            data.checkpoints.insert(collection, timestamp);
        })
    }

    fn next_sequence(&self, tenant: &TenantId) -> StoreResult<u64> {
        self.write(tenant, |data| {
            data.last_sequence += 1;
            data.last_sequence
        })
    }

    fn verify(&self) -> StoreResult<()> {
        self.check()
    }
}

impl MemoryLocalStore {
    fn set_dirty(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: &str,
        dirty: bool,
    ) -> StoreResult<()> {
        self.write(tenant, |data| {
            if let Some(stored) = data
                .records
                .get_mut(&collection)
                .and_then(|records| records.get_mut(id))
            {
                stored.dirty = dirty;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_protocol::{DeviceId, DiningTable, RecordPayload};
    use tempfile::tempdir;

    fn tenant() -> TenantId {
        TenantId::new("curry-house").unwrap()
    }

    fn table(id: &str, updated_at: i64) -> DomainRecord {
        DomainRecord::new(
            id,
            RecordPayload::Table(DiningTable {
                number: 3,
                capacity: 4,
                status: "available".into(),
            }),
            Timestamp::from_millis(updated_at),
            DeviceId::new("till").unwrap(),
            1,
        )
    }

    #[test]
    fn compare_and_upsert_detects_moved_version() {
        let store = MemoryLocalStore::new();
        let t = tenant();

        assert!(store.compare_and_upsert(&t, None, table("t1", 10), true).unwrap());
        assert!(!store.compare_and_upsert(&t, None, table("t1", 20), false).unwrap());

        let v10 = table("t1", 10).version();
        assert!(store.compare_and_upsert(&t, Some(&v10), table("t1", 20), false).unwrap());
        assert!(!store.compare_and_upsert(&t, Some(&v10), table("t1", 30), false).unwrap());
        assert_eq!(store.dirty_count(&t).unwrap(), 0);
    }

    #[test]
    fn dirty_flags_and_query_since() {
        let store = MemoryLocalStore::new();
        let t = tenant();
        store.upsert(&t, table("a", 100)).unwrap();
        store.upsert(&t, table("b", 200)).unwrap();
        store.mark_dirty(&t, Collection::Tables, "b").unwrap();

        let since = store
            .query(&t, Collection::Tables, Some(Timestamp::from_millis(150)))
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(store.list_dirty(&t, Collection::Tables).unwrap()[0].id, "b");

        // upsert keeps the flag
        store.upsert(&t, table("b", 250)).unwrap();
        assert_eq!(store.dirty_count(&t).unwrap(), 1);

        assert!(store.is_dirty(&t, Collection::Tables, "b").unwrap());
        assert!(!store.is_dirty(&t, Collection::Tables, "missing").unwrap());
        store.clear_dirty(&t, Collection::Tables, "b").unwrap();
        assert!(!store.is_dirty(&t, Collection::Tables, "b").unwrap());
        assert_eq!(store.dirty_count(&t).unwrap(), 0);
    }

    #[test]
    fn sequences_are_monotonic_per_tenant() {
        let store = MemoryLocalStore::new();
        let other = TenantId::new("noodle-bar").unwrap();
        assert_eq!(store.next_sequence(&tenant()).unwrap(), 1);
        assert_eq!(store.next_sequence(&tenant()).unwrap(), 2);
        assert_eq!(store.next_sequence(&other).unwrap(), 1);
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        let t = tenant();

        {
            let store = MemoryLocalStore::open(&path).unwrap();
            store.upsert(&t, table("t1", 100)).unwrap();
            store.mark_dirty(&t, Collection::Tables, "t1").unwrap();
            store
                .save_checkpoint(&t, Collection::Tables, Timestamp::from_millis(90))
                .unwrap();
            store.flush().unwrap();
        }

        let store = MemoryLocalStore::open(&path).unwrap();
        assert_eq!(store.get(&t, Collection::Tables, "t1").unwrap(), Some(table("t1", 100)));
        assert_eq!(store.dirty_count(&t).unwrap(), 1);
        assert_eq!(
            store.checkpoint(&t, Collection::Tables).unwrap(),
            Timestamp::from_millis(90)
        );

        let summary = store.summary();
        assert_eq!(summary[0].collections[0].records, 1);
        assert_eq!(summary[0].collections[0].dirty, 1);
    }

    #[test]
    fn garbage_snapshot_is_corrupted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("device.cbor");
        fs::write(&path, b"definitely not cbor").unwrap();

        let err = MemoryLocalStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupted(_)));
    }

    #[test]
    fn corrupted_store_fails_every_call() {
        let store = MemoryLocalStore::new();
        store.set_corrupted(true);
        assert!(store.verify().is_err());
        assert!(store.get(&tenant(), Collection::Orders, "x").is_err());

        store.set_corrupted(false);
        assert!(store.verify().is_ok());
    }
}
