//! Identifiers, timestamps and collection names.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Opaque tenant identifier (one restaurant account).
///
/// Every collection lives inside exactly one tenant namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    /// Creates a tenant id, rejecting blank values.
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::InvalidIdentifier("tenant id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque device identifier.
///
/// Device ids also break exact timestamp ties in conflict resolution, so
/// they are compared lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Creates a device id, rejecting blank values.
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ProtocolError::InvalidIdentifier("device id must not be empty".into()));
        }
        Ok(Self(id))
    }

    /// Generates a random device id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A server-assigned timestamp in milliseconds since the Unix epoch.
///
/// Ordering decisions only ever compare timestamps produced by the remote
/// store. `Timestamp::now` exists for display and for reference stores that
/// play the server role.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The "never synced" timestamp.
    pub const ZERO: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp in milliseconds.
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self(millis)
    }

    /// Returns true if this is a usable server timestamp.
    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    /// Returns the timestamp one millisecond later.
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds a duration, saturating at the maximum.
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(millis))
    }

    /// Subtracts a duration, saturating at the minimum.
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(millis))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later.
    pub fn duration_since(&self, earlier: Timestamp) -> Duration {
        let diff = self.0.saturating_sub(earlier.0);
        Duration::from_millis(u64::try_from(diff).unwrap_or(0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A collection inside a tenant namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Customer orders.
    Orders,
    /// Menu items.
    MenuItems,
    /// Menu categories.
    Categories,
    /// Staff accounts.
    Users,
    /// Dining tables.
    Tables,
    /// Device presence heartbeats. Not a domain collection.
    ActiveDevices,
}

impl Collection {
    /// All domain collections, in the order they are synced.
    pub const DOMAIN: [Collection; 5] = [
        Collection::Categories,
        Collection::MenuItems,
        Collection::Tables,
        Collection::Users,
        Collection::Orders,
    ];

    /// Returns the remote collection name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Orders => "orders",
            Collection::MenuItems => "menu_items",
            Collection::Categories => "categories",
            Collection::Users => "users",
            Collection::Tables => "tables",
            Collection::ActiveDevices => "active_devices",
        }
    }

    /// Returns true if records of this collection are domain records.
    pub fn is_domain(&self) -> bool {
        !matches!(self, Collection::ActiveDevices)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orders" => Ok(Collection::Orders),
            "menu_items" => Ok(Collection::MenuItems),
            "categories" => Ok(Collection::Categories),
            "users" => Ok(Collection::Users),
            "tables" => Ok(Collection::Tables),
            "active_devices" => Ok(Collection::ActiveDevices),
            other => Err(ProtocolError::UnknownCollection(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_identifiers_rejected() {
        assert!(TenantId::new("").is_err());
        assert!(TenantId::new("   ").is_err());
        assert!(DeviceId::new("").is_err());
        assert_eq!(TenantId::new("bombay@example.com").unwrap().as_str(), "bombay@example.com");
    }

    #[test]
    fn generated_device_ids_differ() {
        assert_ne!(DeviceId::generate(), DeviceId::generate());
    }

    #[test]
    fn timestamp_arithmetic() {
        let t = Timestamp::from_millis(1_000);
        assert_eq!(t.saturating_add(Duration::from_secs(1)).as_millis(), 2_000);
        assert_eq!(t.saturating_sub(Duration::from_millis(1_500)).as_millis(), -500);
        assert_eq!(
            Timestamp::from_millis(4_000).duration_since(t),
            Duration::from_millis(3_000)
        );
        assert_eq!(t.duration_since(Timestamp::from_millis(4_000)), Duration::ZERO);
        assert!(!Timestamp::ZERO.is_valid());
        assert_eq!(t.next().as_millis(), 1_001);
    }

    #[test]
    fn collection_names() {
        for collection in Collection::DOMAIN {
            assert!(collection.is_domain());
            assert_eq!(collection.as_str().parse::<Collection>().unwrap(), collection);
        }
        assert!(!Collection::ActiveDevices.is_domain());
        assert!("receipts".parse::<Collection>().is_err());
    }
}
