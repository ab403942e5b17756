//! Storage abstractions for sync operations.
//!
//! The engine only ever talks to storage through these two traits. The
//! local store is an embedded, synchronous store owned by the device. The
//! remote store is a document store reached over the network.

use async_trait::async_trait;
use possync_protocol::{
    Collection, DomainRecord, RecordVersion, RemoteChange, RemoteDocument, TenantId, Timestamp,
};
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a local store.
///
/// Every local store error is fatal for the engine.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Stored data is unreadable or inconsistent.
    #[error("local store corrupted: {0}")]
    Corrupted(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot encoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Result type for remote store operations.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors raised by a remote store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The store cannot be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Credentials expired.
    #[error("authentication expired")]
    AuthExpired,

    /// A single write was refused.
    #[error("rejected {id}: {reason}")]
    Rejected {
        /// Document id.
        id: String,
        /// Reason.
        reason: String,
    },
}

/// Stream of remote change events for one collection.
///
/// The stream ends when the subscription is dropped by the remote side.
pub type ChangeStream = mpsc::UnboundedReceiver<RemoteChange>;

/// The device's embedded record store.
///
/// Every method is atomic with respect to the others.
pub trait LocalStore: Send + Sync + 'static {
    /// Reads one record, including tombstones.
    fn get(&self, tenant: &TenantId, collection: Collection, id: &str)
        -> StoreResult<Option<DomainRecord>>;

    /// Lists records, optionally only those with `updated_at >= since`.
    fn query(
        &self,
        tenant: &TenantId,
        collection: Collection,
        since: Option<Timestamp>,
    ) -> StoreResult<Vec<DomainRecord>>;

    /// Inserts or replaces a record, leaving its dirty flag untouched.
    fn upsert(&self, tenant: &TenantId, record: DomainRecord) -> StoreResult<()>;

    /// Replaces a record only if the stored version equals `expected`.
    ///
    /// `expected == None` means the record must not exist. Sets the dirty
    /// flag to `dirty` on success. Returns false if the stored version moved.
    fn compare_and_upsert(
        &self,
        tenant: &TenantId,
        expected: Option<&RecordVersion>,
        record: DomainRecord,
        dirty: bool,
    ) -> StoreResult<bool>;

    /// Deletes a record and its dirty flag.
    fn remove(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<()>;

    /// Flags a record as changed locally and not yet pushed.
    fn mark_dirty(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<()>;

    /// Clears the dirty flag of a record.
    fn clear_dirty(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<()>;

    /// Returns true if the record exists and is flagged dirty.
    fn is_dirty(&self, tenant: &TenantId, collection: Collection, id: &str) -> StoreResult<bool>;

    /// Lists dirty records of a collection.
    fn list_dirty(&self, tenant: &TenantId, collection: Collection)
        -> StoreResult<Vec<DomainRecord>>;

    /// Counts dirty records across all collections of a tenant.
    fn dirty_count(&self, tenant: &TenantId) -> StoreResult<usize>;

    /// Reads the checkpoint of a collection, zero if it never synced.
    fn checkpoint(&self, tenant: &TenantId, collection: Collection) -> StoreResult<Timestamp>;

    /// Persists the checkpoint of a collection.
    fn save_checkpoint(
        &self,
        tenant: &TenantId,
        collection: Collection,
        timestamp: Timestamp,
    ) -> StoreResult<()>;

    /// Allocates the next per-device sequence number for a tenant.
    fn next_sequence(&self, tenant: &TenantId) -> StoreResult<u64>;

    /// Checks that the store is readable.
    fn verify(&self) -> StoreResult<()>;
}

/// The shared remote document store.
///
/// Every write is stamped with a monotonic server timestamp that replaces
/// the document's `updatedAt`.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Reads one document.
    async fn get(
        &self,
        tenant: &TenantId,
        collection: Collection,
        id: &str,
    ) -> RemoteResult<Option<RemoteDocument>>;

    /// Lists documents.
    ///
    /// With `since`, only documents whose `updatedAt >= since` are returned.
    /// Without it, every document is returned, including ones that carry no
    /// timestamp at all.
    async fn query(
        &self,
        tenant: &TenantId,
        collection: Collection,
        since: Option<Timestamp>,
    ) -> RemoteResult<Vec<RemoteDocument>>;

    /// Writes a document and returns its server timestamp.
    async fn put(
        &self,
        tenant: &TenantId,
        collection: Collection,
        document: RemoteDocument,
    ) -> RemoteResult<Timestamp>;

    /// Deletes a document. Deleting a missing document succeeds.
    async fn delete(&self, tenant: &TenantId, collection: Collection, id: &str)
        -> RemoteResult<()>;

    /// Subscribes to changes of a collection.
    async fn subscribe(&self, tenant: &TenantId, collection: Collection)
        -> RemoteResult<ChangeStream>;
}
