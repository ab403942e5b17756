use crate::store::{ChangeStream, RemoteError, RemoteResult, RemoteStore};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use possync_protocol::{Collection, RemoteChange, RemoteDocument, TenantId, Timestamp};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

type Key = (TenantId, Collection);

#[derive(Debug)]
struct ServerClock {
    last: Timestamp,
    manual: Option<Timestamp>,
}

impl ServerClock {
    fn wall(&self) -> Timestamp {
        self.manual.unwrap_or_else(Timestamp::now)
    }

    fn stamp(&mut self) -> Timestamp {
        let ts = self.wall().max(self.last.next());
        self.last = ts;
        ts
    }
}

/// An in-memory remote document store.
///
/// Writes are stamped by a strictly monotonic server clock, which follows
/// wall-clock time unless created with
/// [`with_manual_clock`](Self::with_manual_clock). Subscribers receive
/// every change synchronously with the write.
#[derive(Debug)]
pub struct MemoryRemoteStore {
    documents: RwLock<HashMap<Key, BTreeMap<String, RemoteDocument>>>,
    subscribers: Mutex<HashMap<Key, Vec<mpsc::UnboundedSender<RemoteChange>>>>,
    clock: Mutex<ServerClock>,
    connected: AtomicBool,
    auth_expired: AtomicBool,
    rejected: RwLock<HashSet<String>>,
}

impl MemoryRemoteStore {
    /// Creates an empty store stamped by wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(None)
    }

    /// Creates an empty store whose clock starts at `start` and only moves
    /// when advanced or written to.
    pub fn with_manual_clock(start: Timestamp) -> Self {
        Self::with_clock(Some(start))
    }

    fn with_clock(manual: Option<Timestamp>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            clock: Mutex::new(ServerClock {
                last: Timestamp::ZERO,
                manual,
            }),
            connected: AtomicBool::new(true),
            auth_expired: AtomicBool::new(false),
            rejected: RwLock::new(HashSet::new()),
        }
    }

    /// Advances a manual clock. Has no effect on wall-clock stores.
    pub fn advance_clock(&self, by: Duration) {
        let mut clock = self.clock.lock();
        if let Some(now) = clock.manual {
            clock.manual = Some(now.saturating_add(by));
        }
    }

    /// Current server time, never earlier than the latest stamp.
    pub fn now(&self) -> Timestamp {
        let clock = self.clock.lock();
        clock.wall().max(clock.last)
    }

    /// Simulates losing or regaining connectivity.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            self.drop_subscribers();
        }
    }

    /// Simulates expired credentials.
    pub fn set_auth_expired(&self, expired: bool) {
        self.auth_expired.store(expired, Ordering::SeqCst);
    }

    /// Makes every write of document `id` fail with [`RemoteError::Rejected`].
    pub fn reject_writes_to(&self, id: impl Into<String>) {
        self.rejected.write().insert(id.into());
    }

    /// Ends every open subscription.
    pub fn drop_subscribers(&self) {
        self.subscribers.lock().clear();
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers
            .values_mut()
            .map(|senders| {
                senders.retain(|s| !s.is_closed());
                senders.len()
            })
            .sum()
    }

    /// Stores a document as-is, without stamping or notifying.
    ///
    /// Used to load fixtures, including documents with missing or invalid
    /// timestamps.
    pub fn seed(&self, tenant: &TenantId, collection: Collection, document: RemoteDocument) {
        let mut documents = self.documents.write();
        if let Some(ts) = document.updated_at() {
            let mut clock = self.clock.lock();
            clock.last = clock.last.max(ts);
        }
        documents
            .entry((tenant.clone(), collection))
            .or_default()
            .insert(document.id.clone(), document);
    }

    /// Reads a document without connectivity checks.
    pub fn document(&self, tenant: &TenantId, collection: Collection, id: &str) -> Option<RemoteDocument> {
        self.documents
            .read()
            .get(&(tenant.clone(), collection))
            .and_then(|docs| docs.get(id))
            .cloned()
    }

    /// Number of documents in a collection.
    pub fn document_count(&self, tenant: &TenantId, collection: Collection) -> usize {
        self.documents
            .read()
            .get(&(tenant.clone(), collection))
            .map_or(0, BTreeMap::len)
    }

    fn check(&self) -> RemoteResult<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote store offline".into()));
        }
        if self.auth_expired.load(Ordering::SeqCst) {
            return Err(RemoteError::AuthExpired);
        }
        Ok(())
    }

    fn notify(&self, key: &Key, change: RemoteChange) {
        let mut subscribers = self.subscribers.lock();
        if let Some(senders) = subscribers.get_mut(key) {
            senders.retain(|s| s.send(change.clone()).is_ok());
        }
    }
}

impl Default for MemoryRemoteStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: &str,
    ) -> RemoteResult<Option<RemoteDocument>> {
        self.check()?;
        Ok(self.document(tenant, collection, id))
    }

    async fn query(
        &self,
        tenant: &TenantId,
        collection: Collection,
        since: Option<Timestamp>,
    ) -> RemoteResult<Vec<RemoteDocument>> {
        self.check()?;
        let documents = self.documents.read();
        let mut result: Vec<RemoteDocument> = documents
            .get(&(tenant.clone(), collection))
            .map(|docs| {
                docs.values()
                    .filter(|doc| match since {
                        Some(since) => doc.updated_at().is_some_and(|ts| ts >= since),
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        result.sort_by(|a, b| a.updated_at().cmp(&b.updated_at()).then_with(|| a.id.cmp(&b.id)));
        Ok(result)
    }

    async fn put(
        &self,
        tenant: &TenantId,
        collection: Collection,
        mut document: RemoteDocument,
    ) -> RemoteResult<Timestamp> {
        self.check()?;
        if self.rejected.read().contains(&document.id) {
            return Err(RemoteError::Rejected {
                id: document.id,
                reason: "write refused by server rules".into(),
            });
        }

        let key = (tenant.clone(), collection);
        let mut documents = self.documents.write();
        let ts = self.clock.lock().stamp();
        document.set_updated_at(ts);

        let docs = documents.entry(key.clone()).or_default();
        let change = if docs.contains_key(&document.id) {
            RemoteChange::modified(document.clone())
        } else {
            RemoteChange::added(document.clone())
        };
        docs.insert(document.id.clone(), document);
        self.notify(&key, change);
        Ok(ts)
    }

    async fn delete(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: &str,
    ) -> RemoteResult<()> {
        self.check()?;
        let key = (tenant.clone(), collection);
        let mut documents = self.documents.write();
        let removed = documents.get_mut(&key).and_then(|docs| docs.remove(id));
        if let Some(document) = removed {
            self.notify(&key, RemoteChange::removed(document));
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        tenant: &TenantId,
        collection: Collection,
    ) -> RemoteResult<ChangeStream> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry((tenant.clone(), collection))
            .or_default()
            .push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use possync_protocol::ChangeKind;
    use serde_json::{json, Map, Value};

    fn tenant() -> TenantId {
        TenantId::new("t").unwrap()
    }

    fn doc(id: &str) -> RemoteDocument {
        let Value::Object(fields) = json!({"name": id}) else {
            unreachable!()
        };
        RemoteDocument::new(id, fields)
    }

    #[tokio::test]
    async fn writes_get_monotonic_timestamps() {
        let remote = MemoryRemoteStore::with_manual_clock(Timestamp::from_millis(1_000));
        let t = tenant();

        let a = remote.put(&t, Collection::Users, doc("a")).await.unwrap();
        let b = remote.put(&t, Collection::Users, doc("b")).await.unwrap();
        assert_eq!(a, Timestamp::from_millis(1_000));
        assert_eq!(b, Timestamp::from_millis(1_001));

        remote.advance_clock(Duration::from_secs(1));
        let c = remote.put(&t, Collection::Users, doc("a")).await.unwrap();
        assert_eq!(c, Timestamp::from_millis(2_000));
    }

    #[tokio::test]
    async fn query_since_is_inclusive_and_skips_untimed() {
        let remote = MemoryRemoteStore::with_manual_clock(Timestamp::from_millis(100));
        let t = tenant();
        remote.seed(&t, Collection::Users, RemoteDocument::new("untimed", Map::new()));
        remote.put(&t, Collection::Users, doc("a")).await.unwrap();
        remote.put(&t, Collection::Users, doc("b")).await.unwrap();

        let since = remote
            .query(&t, Collection::Users, Some(Timestamp::from_millis(101)))
            .await
            .unwrap();
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "b");

        let all = remote.query(&t, Collection::Users, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let remote = MemoryRemoteStore::new();
        let t = tenant();
        let mut stream = remote.subscribe(&t, Collection::Tables).await.unwrap();

        remote.put(&t, Collection::Tables, doc("t1")).await.unwrap();
        remote.put(&t, Collection::Tables, doc("t1")).await.unwrap();
        remote.delete(&t, Collection::Tables, "t1").await.unwrap();

        let kinds: Vec<ChangeKind> = (0..3).map(|_| stream.try_recv().unwrap().kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Added, ChangeKind::Modified, ChangeKind::Removed]);
    }

    #[tokio::test]
    async fn faults_are_reported() {
        let remote = MemoryRemoteStore::new();
        let t = tenant();

        remote.reject_writes_to("bad");
        assert!(matches!(
            remote.put(&t, Collection::Users, doc("bad")).await,
            Err(RemoteError::Rejected { .. })
        ));

        remote.set_auth_expired(true);
        assert_eq!(remote.get(&t, Collection::Users, "x").await, Err(RemoteError::AuthExpired));
        remote.set_auth_expired(false);

        let mut stream = remote.subscribe(&t, Collection::Users).await.unwrap();
        remote.set_connected(false);
        assert!(stream.recv().await.is_none());
        assert!(matches!(
            remote.query(&t, Collection::Users, None).await,
            Err(RemoteError::Unavailable(_))
        ));
    }
}
