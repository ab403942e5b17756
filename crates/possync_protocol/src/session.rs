//! Device sessions and their heartbeat documents.

use crate::error::{ConversionError, ConversionResult};
use crate::record::{fields, RemoteDocument};
use crate::types::{Collection, DeviceId, TenantId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Role of the user logged in on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// Restaurant owner / administrator.
    Admin,
    /// Shift manager.
    Manager,
    /// Floor server.
    Server,
    /// Cashier.
    Cashier,
    /// Kitchen display.
    Kitchen,
}

impl DeviceRole {
    /// Returns the stored name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Admin => "admin",
            DeviceRole::Manager => "manager",
            DeviceRole::Server => "server",
            DeviceRole::Cashier => "cashier",
            DeviceRole::Kitchen => "kitchen",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "admin" => Ok(DeviceRole::Admin),
            "manager" => Ok(DeviceRole::Manager),
            "server" => Ok(DeviceRole::Server),
            "cashier" => Ok(DeviceRole::Cashier),
            "kitchen" => Ok(DeviceRole::Kitchen),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// A logged-in device of a tenant.
///
/// Only the device that created the session writes its heartbeat document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSession {
    /// Device.
    pub device_id: DeviceId,
    /// Tenant.
    pub tenant_id: TenantId,
    /// Logged-in user.
    pub user_id: String,
    /// Role of the logged-in user.
    pub role: DeviceRole,
    /// Server time of the first heartbeat.
    pub login_time: Timestamp,
    /// Server time of the latest heartbeat.
    pub last_heartbeat: Timestamp,
}

impl DeviceSession {
    /// Creates a session that has not sent a heartbeat yet.
    pub fn new(
        device_id: DeviceId,
        tenant_id: TenantId,
        user_id: impl Into<String>,
        role: DeviceRole,
    ) -> Self {
        Self {
            device_id,
            tenant_id,
            user_id: user_id.into(),
            role,
            login_time: Timestamp::ZERO,
            last_heartbeat: Timestamp::ZERO,
        }
    }

    /// Returns true if the last heartbeat is younger than `ttl` at `now`.
    pub fn is_live(&self, now: Timestamp, ttl: Duration) -> bool {
        self.last_heartbeat.is_valid() && now.duration_since(self.last_heartbeat) < ttl
    }

    /// Builds the heartbeat document for this session.
    pub fn to_heartbeat_document(&self) -> RemoteDocument {
        let mut map = Map::new();
        map.insert("deviceId".into(), Value::String(self.device_id.to_string()));
        map.insert("tenantId".into(), Value::String(self.tenant_id.to_string()));
        map.insert("userId".into(), Value::String(self.user_id.clone()));
        map.insert("role".into(), Value::String(self.role.to_string()));
        map.insert("loginTime".into(), Value::from(self.login_time.as_millis()));
        RemoteDocument::new(self.device_id.to_string(), map)
    }

    /// Parses a heartbeat document; the server timestamp is the heartbeat.
    pub fn from_heartbeat_document(doc: &RemoteDocument) -> ConversionResult<Self> {
        let collection = Collection::ActiveDevices.to_string();
        let text = |name: &str| doc.fields.get(name).and_then(Value::as_str);

        let missing: Vec<String> = ["deviceId", "tenantId", "userId", "role"]
            .iter()
            .filter(|name| text(**name).is_none())
            .map(|name| (*name).to_string())
            .chain(doc.updated_at().is_none().then(|| fields::UPDATED_AT.to_string()))
            .collect();
        if !missing.is_empty() {
            return Err(ConversionError::MissingFields {
                collection,
                id: doc.id.clone(),
                missing,
            });
        }

        let malformed = |reason: String| ConversionError::Malformed {
            collection: collection.clone(),
            id: doc.id.clone(),
            reason,
        };

        let device_id = DeviceId::new(text("deviceId").unwrap_or_default())
            .map_err(|e| malformed(e.to_string()))?;
        let tenant_id = TenantId::new(text("tenantId").unwrap_or_default())
            .map_err(|e| malformed(e.to_string()))?;
        let role = text("role").unwrap_or_default().parse().map_err(malformed)?;
        let last_heartbeat = doc.updated_at().unwrap_or(Timestamp::ZERO);
        let login_time = doc
            .fields
            .get("loginTime")
            .and_then(Value::as_i64)
            .map(Timestamp::from_millis)
            .filter(Timestamp::is_valid)
            .unwrap_or(last_heartbeat);

        Ok(Self {
            device_id,
            tenant_id,
            user_id: text("userId").unwrap_or_default().to_string(),
            role,
            login_time,
            last_heartbeat,
        })
    }
}
