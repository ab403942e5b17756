//! Domain records and their remote document representation.
//!
//! Remote documents are loosely typed JSON maps. They are converted into
//! typed record kinds exactly once, at the boundary, by
//! [`RecordPayload::from_fields`]; nothing past that point handles untyped
//! maps.

use crate::error::{ConversionError, ConversionResult};
use crate::types::{Collection, DeviceId, Timestamp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata field names stored next to the payload in remote documents.
pub mod fields {
    /// Server-assigned modification timestamp (milliseconds).
    pub const UPDATED_AT: &str = "updatedAt";
    /// Tombstone flag.
    pub const DELETED: &str = "deleted";
    /// Device that produced the version.
    pub const ORIGIN_DEVICE_ID: &str = "originDeviceId";
    /// Per-device monotonic sequence number.
    pub const DEVICE_SEQUENCE: &str = "deviceSequence";

    pub(crate) const ALL: [&str; 4] = [UPDATED_AT, DELETED, ORIGIN_DEVICE_ID, DEVICE_SEQUENCE];
}

/// A document as stored in the remote document store.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteDocument {
    /// Document id (the record id).
    pub id: String,
    /// All document fields, metadata included.
    pub fields: Map<String, Value>,
}

impl RemoteDocument {
    /// Creates a document.
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Returns the server timestamp, if present and numeric.
    pub fn updated_at(&self) -> Option<Timestamp> {
        self.fields
            .get(fields::UPDATED_AT)
            .and_then(Value::as_i64)
            .map(Timestamp::from_millis)
    }

    /// Sets the server timestamp.
    pub fn set_updated_at(&mut self, timestamp: Timestamp) {
        self.fields
            .insert(fields::UPDATED_AT.into(), Value::from(timestamp.as_millis()));
    }

    /// Returns true if the document is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.fields
            .get(fields::DELETED)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    /// Menu item ordered.
    pub menu_item_id: String,
    /// Quantity.
    pub quantity: u32,
    /// Unit price in cents.
    pub price_cents: i64,
    /// Kitchen notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Human-facing order number.
    pub order_number: String,
    /// Lifecycle status (`pending`, `preparing`, `served`, ...).
    pub status: String,
    /// Ordered lines.
    pub items: Vec<OrderLine>,
    /// Table the order belongs to, if dine-in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    /// Staff member that opened the order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl Order {
    /// Sum of all lines in cents, or `None` if it overflows.
    pub fn total_cents(&self) -> Option<i64> {
        self.items.iter().try_fold(0i64, |total, line| {
            line.price_cents
                .checked_mul(i64::from(line.quantity))
                .and_then(|amount| total.checked_add(amount))
        })
    }
}

/// A menu item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuItem {
    /// Display name.
    pub name: String,
    /// Owning category id.
    pub category_id: String,
    /// Price in cents.
    pub price_cents: i64,
    /// Whether the item can be ordered.
    #[serde(default = "default_true")]
    pub is_available: bool,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A menu category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    /// Display name.
    pub name: String,
    /// Position in menus.
    #[serde(default)]
    pub sort_order: i64,
    /// Whether the category is shown.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Display colour, e.g. `#FF6B6B`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

/// A staff account. Credentials are not part of the synced record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffUser {
    /// Display name.
    pub name: String,
    /// Role name.
    pub role: String,
    /// Whether the account can log in.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

/// A dining table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiningTable {
    /// Table number shown to staff.
    pub number: u32,
    /// Seats.
    #[serde(default)]
    pub capacity: u32,
    /// Occupancy status.
    #[serde(default = "default_table_status")]
    pub status: String,
}

fn default_true() -> bool {
    true
}

fn default_table_status() -> String {
    "available".to_string()
}

/// A typed record payload, one variant per domain collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RecordPayload {
    /// An order.
    Order(Order),
    /// A menu item.
    MenuItem(MenuItem),
    /// A category.
    Category(Category),
    /// A staff account.
    User(StaffUser),
    /// A dining table.
    Table(DiningTable),
}

impl RecordPayload {
    /// Returns the collection this payload belongs to.
    pub fn collection(&self) -> Collection {
        match self {
            RecordPayload::Order(_) => Collection::Orders,
            RecordPayload::MenuItem(_) => Collection::MenuItems,
            RecordPayload::Category(_) => Collection::Categories,
            RecordPayload::User(_) => Collection::Users,
            RecordPayload::Table(_) => Collection::Tables,
        }
    }

    /// Converts remote document fields into a typed payload.
    ///
    /// Fails with [`ConversionError::MissingFields`] when any required
    /// field of the kind is absent or null, and with
    /// [`ConversionError::Malformed`] when the fields are present but do not
    /// describe a valid record.
    pub fn from_fields(
        collection: Collection,
        id: &str,
        fields: &Map<String, Value>,
    ) -> ConversionResult<Self> {
        match collection {
            Collection::Orders => {
                let order: Order = decode(collection, id, fields, &["orderNumber", "status", "items"])?;
                if order.items.iter().any(|line| line.quantity == 0) {
                    return Err(malformed(collection, id, "order line with zero quantity"));
                }
                if order.items.iter().any(|line| line.price_cents < 0) {
                    return Err(malformed(collection, id, "order line with negative price"));
                }
                Ok(RecordPayload::Order(order))
            }
            Collection::MenuItems => {
                let item: MenuItem = decode(collection, id, fields, &["name", "categoryId", "priceCents"])?;
                if item.name.trim().is_empty() {
                    return Err(malformed(collection, id, "empty name"));
                }
                if item.price_cents < 0 {
                    return Err(malformed(collection, id, "negative price"));
                }
                Ok(RecordPayload::MenuItem(item))
            }
            Collection::Categories => {
                let category: Category = decode(collection, id, fields, &["name"])?;
                if category.name.trim().is_empty() {
                    return Err(malformed(collection, id, "empty name"));
                }
                Ok(RecordPayload::Category(category))
            }
            Collection::Users => {
                let user: StaffUser = decode(collection, id, fields, &["name", "role"])?;
                if user.name.trim().is_empty() {
                    return Err(malformed(collection, id, "empty name"));
                }
                Ok(RecordPayload::User(user))
            }
            Collection::Tables => {
                let table: DiningTable = decode(collection, id, fields, &["number"])?;
                if table.number == 0 {
                    return Err(malformed(collection, id, "table number must be positive"));
                }
                Ok(RecordPayload::Table(table))
            }
            Collection::ActiveDevices => Err(ConversionError::NotDomain(collection.to_string())),
        }
    }

    /// Serializes the payload into document fields (no metadata).
    pub fn to_fields(&self) -> Map<String, Value> {
        let value = match self {
            RecordPayload::Order(v) => serde_json::to_value(v),
            RecordPayload::MenuItem(v) => serde_json::to_value(v),
            RecordPayload::Category(v) => serde_json::to_value(v),
            RecordPayload::User(v) => serde_json::to_value(v),
            RecordPayload::Table(v) => serde_json::to_value(v),
        };
        match value {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn malformed(collection: Collection, id: &str, reason: &str) -> ConversionError {
    ConversionError::Malformed {
        collection: collection.to_string(),
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

fn decode<T: DeserializeOwned>(
    collection: Collection,
    id: &str,
    fields: &Map<String, Value>,
    required: &[&str],
) -> ConversionResult<T> {
    let missing: Vec<String> = required
        .iter()
        .filter(|name| fields.get(**name).map_or(true, Value::is_null))
        .map(|name| (*name).to_string())
        .collect();
    if !missing.is_empty() {
        return Err(ConversionError::MissingFields {
            collection: collection.to_string(),
            id: id.to_string(),
            missing,
        });
    }

    let payload: Map<String, Value> = fields
        .iter()
        .filter(|(key, _)| !fields::ALL.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    serde_json::from_value(Value::Object(payload))
        .map_err(|e| malformed(collection, id, &e.to_string()))
}

/// The ordering key of a record version.
///
/// Fields are declared in comparison order, so the derived `Ord` is the
/// conflict resolver's total order: timestamp first, then tombstone over
/// update, then origin device, then per-device sequence.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordVersion {
    /// Server timestamp (provisional for unpushed local edits).
    pub updated_at: Timestamp,
    /// Tombstone flag.
    pub deleted: bool,
    /// Device that produced the version.
    pub origin_device_id: Option<DeviceId>,
    /// Per-device sequence number.
    pub sequence: u64,
}

/// A synchronized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Record id, unique within its collection.
    pub id: String,
    /// Owning collection.
    pub collection: Collection,
    /// Typed payload. Tombstones may omit it.
    pub payload: Option<RecordPayload>,
    /// Server timestamp of this version.
    pub updated_at: Timestamp,
    /// Tombstone flag.
    pub deleted: bool,
    /// Device that produced this version.
    pub origin_device_id: Option<DeviceId>,
    /// Per-device sequence number of this version.
    pub sequence: u64,
}

impl DomainRecord {
    /// Creates a live record.
    pub fn new(
        id: impl Into<String>,
        payload: RecordPayload,
        updated_at: Timestamp,
        origin_device_id: DeviceId,
        sequence: u64,
    ) -> Self {
        Self {
            id: id.into(),
            collection: payload.collection(),
            payload: Some(payload),
            updated_at,
            deleted: false,
            origin_device_id: Some(origin_device_id),
            sequence,
        }
    }

    /// Creates a tombstone.
    pub fn tombstone(
        id: impl Into<String>,
        collection: Collection,
        updated_at: Timestamp,
        origin_device_id: DeviceId,
        sequence: u64,
    ) -> Self {
        Self {
            id: id.into(),
            collection,
            payload: None,
            updated_at,
            deleted: true,
            origin_device_id: Some(origin_device_id),
            sequence,
        }
    }

    /// Returns true if this record is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.deleted
    }

    /// Returns the version of this record.
    pub fn version(&self) -> RecordVersion {
        RecordVersion {
            updated_at: self.updated_at,
            deleted: self.deleted,
            origin_device_id: self.origin_device_id.clone(),
            sequence: self.sequence,
        }
    }

    /// Converts a remote document of `collection` into a record.
    ///
    /// Tombstone documents do not need the payload's required fields; a
    /// payload that still parses is kept. Documents without a timestamp
    /// convert with [`Timestamp::ZERO`], which the resolver flags.
    pub fn from_document(collection: Collection, doc: &RemoteDocument) -> ConversionResult<Self> {
        if !collection.is_domain() {
            return Err(ConversionError::NotDomain(collection.to_string()));
        }
        if doc.id.trim().is_empty() {
            return Err(malformed(collection, &doc.id, "empty document id"));
        }

        let deleted = doc.is_deleted();
        let payload = if deleted {
            RecordPayload::from_fields(collection, &doc.id, &doc.fields).ok()
        } else {
            Some(RecordPayload::from_fields(collection, &doc.id, &doc.fields)?)
        };

        let origin_device_id = match doc.fields.get(fields::ORIGIN_DEVICE_ID) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => DeviceId::new(s.clone()).ok(),
            Some(_) => return Err(malformed(collection, &doc.id, "originDeviceId is not a string")),
        };

        let sequence = match doc.fields.get(fields::DEVICE_SEQUENCE) {
            None | Some(Value::Null) => 0,
            Some(value) => value
                .as_u64()
                .ok_or_else(|| malformed(collection, &doc.id, "deviceSequence is not an unsigned integer"))?,
        };

        Ok(Self {
            id: doc.id.clone(),
            collection,
            payload,
            updated_at: doc.updated_at().unwrap_or(Timestamp::ZERO),
            deleted,
            origin_device_id,
            sequence,
        })
    }

    /// Converts this record into a remote document.
    ///
    /// The timestamp is included for completeness; remote stores overwrite
    /// it with their own on write.
    pub fn to_document(&self) -> RemoteDocument {
        let mut map = self
            .payload
            .as_ref()
            .map(RecordPayload::to_fields)
            .unwrap_or_default();
        map.insert(fields::DELETED.into(), Value::Bool(self.deleted));
        if let Some(origin) = &self.origin_device_id {
            map.insert(fields::ORIGIN_DEVICE_ID.into(), Value::String(origin.to_string()));
        }
        map.insert(fields::DEVICE_SEQUENCE.into(), Value::from(self.sequence));
        let mut doc = RemoteDocument::new(self.id.clone(), map);
        doc.set_updated_at(self.updated_at);
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn order_fields() -> Map<String, Value> {
        object(json!({
            "orderNumber": "A-17",
            "status": "pending",
            "items": [{"menuItemId": "naan", "quantity": 2, "priceCents": 350}],
            "tableId": "t4",
            "updatedAt": 150,
            "originDeviceId": "tablet-2",
            "deviceSequence": 9
        }))
    }

    #[test]
    fn order_document_converts() {
        let doc = RemoteDocument::new("o1", order_fields());
        let record = DomainRecord::from_document(Collection::Orders, &doc).unwrap();

        assert_eq!(record.updated_at, Timestamp::from_millis(150));
        assert_eq!(record.origin_device_id, Some(DeviceId::new("tablet-2").unwrap()));
        assert_eq!(record.sequence, 9);
        match record.payload {
            Some(RecordPayload::Order(order)) => {
                assert_eq!(order.order_number, "A-17");
                assert_eq!(order.total_cents(), Some(700));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn order_total_overflow_is_none() {
        let mut fields = order_fields();
        fields.insert(
            "items".into(),
            json!([
                {"menuItemId": "gold-thali", "quantity": 4, "priceCents": i64::MAX / 2},
                {"menuItemId": "naan", "quantity": 1, "priceCents": 350}
            ]),
        );
        let doc = RemoteDocument::new("o1", fields);
        let record = DomainRecord::from_document(Collection::Orders, &doc).unwrap();
        let Some(RecordPayload::Order(order)) = record.payload else {
            panic!("expected an order");
        };
        assert_eq!(order.total_cents(), None);
    }

    #[test]
    fn missing_required_field_is_skippable() {
        let mut fields = order_fields();
        fields.remove("items");
        let doc = RemoteDocument::new("o1", fields);

        let err = DomainRecord::from_document(Collection::Orders, &doc).unwrap_err();
        assert!(err.is_skippable());
        assert!(matches!(err, ConversionError::MissingFields { ref missing, .. } if missing == &["items".to_string()]));
    }

    #[test]
    fn config_document_is_skipped() {
        let doc = RemoteDocument::new(
            "_settings",
            object(json!({"taxRate": 0.13, "currency": "CAD"})),
        );
        let err = DomainRecord::from_document(Collection::MenuItems, &doc).unwrap_err();
        assert!(err.is_skippable());
    }

    #[test]
    fn wrong_types_are_malformed() {
        let mut fields = order_fields();
        fields.insert("items".into(), json!("two naans"));
        let doc = RemoteDocument::new("o1", fields);

        let err = DomainRecord::from_document(Collection::Orders, &doc).unwrap_err();
        assert!(!err.is_skippable());
    }

    #[test]
    fn invalid_values_are_malformed() {
        let doc = RemoteDocument::new(
            "t0",
            object(json!({"number": 0, "updatedAt": 5})),
        );
        let err = DomainRecord::from_document(Collection::Tables, &doc).unwrap_err();
        assert!(matches!(err, ConversionError::Malformed { .. }));
    }

    #[test]
    fn tombstone_without_payload_converts() {
        let doc = RemoteDocument::new(
            "o1",
            object(json!({"deleted": true, "updatedAt": 300, "originDeviceId": "tablet-1"})),
        );
        let record = DomainRecord::from_document(Collection::Orders, &doc).unwrap();
        assert!(record.is_tombstone());
        assert!(record.payload.is_none());
    }

    #[test]
    fn missing_timestamp_converts_as_zero() {
        let mut fields = order_fields();
        fields.remove("updatedAt");
        let doc = RemoteDocument::new("o1", fields);
        let record = DomainRecord::from_document(Collection::Orders, &doc).unwrap();
        assert_eq!(record.updated_at, Timestamp::ZERO);
    }

    #[test]
    fn presence_documents_are_not_domain_records() {
        let doc = RemoteDocument::new("tablet-1", Map::new());
        let err = DomainRecord::from_document(Collection::ActiveDevices, &doc).unwrap_err();
        assert!(matches!(err, ConversionError::NotDomain(_)));
    }

    #[test]
    fn document_carries_metadata() {
        let record = DomainRecord::new(
            "c1",
            RecordPayload::Category(Category {
                name: "SOUPS".into(),
                sort_order: 1,
                is_active: true,
                description: None,
                color: Some("#FF6B6B".into()),
            }),
            Timestamp::from_millis(42),
            DeviceId::new("tablet-1").unwrap(),
            3,
        );
        let doc = record.to_document();

        assert_eq!(doc.updated_at(), Some(Timestamp::from_millis(42)));
        assert_eq!(doc.fields["originDeviceId"], json!("tablet-1"));
        assert_eq!(doc.fields["deviceSequence"], json!(3));
        assert_eq!(doc.fields["name"], json!("SOUPS"));
        assert_eq!(DomainRecord::from_document(Collection::Categories, &doc).unwrap(), record);
    }

    #[test]
    fn version_order_prefers_tombstone_on_tie() {
        let device = DeviceId::new("a").unwrap();
        let update = DomainRecord::new(
            "t1",
            RecordPayload::Table(DiningTable {
                number: 1,
                capacity: 4,
                status: "available".into(),
            }),
            Timestamp::from_millis(10),
            device.clone(),
            5,
        );
        let tombstone = DomainRecord::tombstone("t1", Collection::Tables, Timestamp::from_millis(10), device, 1);
        assert!(tombstone.version() > update.version());
    }
}
