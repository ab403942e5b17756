//! In-memory store implementations.
//!
//! [`MemoryLocalStore`] can persist itself as a CBOR snapshot and backs
//! the CLI. [`MemoryRemoteStore`] plays the shared document store in tests
//! and simulations, with a controllable server clock and fault injection.

mod local;
mod remote;

pub use local::{CollectionSummary, MemoryLocalStore, TenantSummary};
pub use remote::MemoryRemoteStore;
