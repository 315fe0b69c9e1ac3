//! Record types for the visible state of entities.

use crate::{EntityId, EntityType, Hlc, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Origin of a record change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Captured on this device
    Local,
    /// Received from another device
    Remote,
}

/// Metadata associated with a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// When the record was first created (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last changed (milliseconds since epoch)
    pub updated_at: Timestamp,
    /// Where the last change came from
    pub origin: Origin,
    /// Clock value of the last change
    pub hlc: Hlc,
}

impl Metadata {
    pub fn new(timestamp: Timestamp, hlc: Hlc, origin: Origin) -> Self {
        Self {
            created_at: timestamp,
            updated_at: timestamp,
            origin,
            hlc,
        }
    }

    /// Update metadata for a modification. The clock value never moves back.
    pub fn touch(&mut self, timestamp: Timestamp, hlc: &Hlc, origin: Origin) {
        self.updated_at = self.updated_at.max(timestamp);
        if *hlc > self.hlc {
            self.hlc = hlc.clone();
        }
        self.origin = origin;
    }
}

/// The visible state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: EntityId,
    pub entity_type: EntityType,
    /// Incremented on each visible change
    pub version: Version,
    /// Non-system fields
    pub payload: Map<String, Value>,
    pub metadata: Metadata,
    /// Tombstone flag
    pub deleted: bool,
}

impl Record {
    pub fn new(
        id: impl Into<EntityId>,
        entity_type: EntityType,
        payload: Map<String, Value>,
        timestamp: Timestamp,
        hlc: Hlc,
        origin: Origin,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            version: 1,
            payload,
            metadata: Metadata::new(timestamp, hlc, origin),
            deleted: false,
        }
    }

    /// Check if record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Visible value of a field; absent fields read as `null`.
    pub fn field(&self, name: &str) -> &Value {
        self.payload.get(name).unwrap_or(&Value::Null)
    }

    /// Set a field. `null` removes it.
    pub fn set_field(
        &mut self,
        name: &str,
        value: Value,
        timestamp: Timestamp,
        hlc: &Hlc,
        origin: Origin,
    ) {
        if value.is_null() {
            self.payload.remove(name);
        } else {
            self.payload.insert(name.to_string(), value);
        }
        self.version += 1;
        self.metadata.touch(timestamp, hlc, origin);
    }

    /// Replace several fields at once as one visible change.
    pub fn replace_payload(
        &mut self,
        payload: Map<String, Value>,
        timestamp: Timestamp,
        hlc: &Hlc,
        origin: Origin,
    ) {
        self.payload = payload;
        self.version += 1;
        self.metadata.touch(timestamp, hlc, origin);
    }

    /// Mark record as deleted (tombstone).
    pub fn mark_deleted(&mut self, timestamp: Timestamp, hlc: &Hlc, origin: Origin) {
        self.deleted = true;
        self.version += 1;
        self.metadata.touch(timestamp, hlc, origin);
    }

    /// The record as a flat JSON object, including `id` and timestamps.
    pub fn to_json(&self) -> Value {
        let mut obj = self.payload.clone();
        obj.insert("id".into(), Value::from(self.id.clone()));
        obj.insert(
            "createdAt".into(),
            Value::from(iso_timestamp(self.metadata.created_at)),
        );
        obj.insert(
            "updatedAt".into(),
            Value::from(iso_timestamp(self.metadata.updated_at)),
        );
        Value::Object(obj)
    }
}

/// RFC 3339 form (UTC, millisecond precision) of a millisecond timestamp.
pub fn iso_timestamp(ms: Timestamp) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
