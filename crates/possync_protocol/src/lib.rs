//! # possync Protocol
//!
//! Record and conflict types shared by every possync component.
//!
//! This crate provides:
//! - Identifiers (`TenantId`, `DeviceId`) and server `Timestamp`s
//! - Typed record kinds and the `DomainRecord` envelope
//! - Validated conversion from loosely-typed remote documents
//! - `SyncCheckpoint` and `DeviceSession`
//! - The last-write-wins conflict resolver
//!
//! This is a pure crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod checkpoint;
mod conflict;
mod error;
mod record;
mod session;
mod types;

pub use change::{ChangeKind, RemoteChange};
pub use checkpoint::SyncCheckpoint;
pub use conflict::{resolve, ConflictApplyError, Resolution};
pub use error::{ConversionError, ConversionResult, ProtocolError};
pub use record::{
    fields, Category, DiningTable, DomainRecord, MenuItem, Order, OrderLine, RecordPayload,
    RecordVersion, RemoteDocument, StaffUser,
};
pub use session::{DeviceRole, DeviceSession};
pub use types::{Collection, DeviceId, TenantId, Timestamp};
