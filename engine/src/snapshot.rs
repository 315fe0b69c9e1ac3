//! Snapshot types for persisting and restoring store state.
//!
//! Snapshots are the bridge between the in-memory Store and persistent storage.
//! They are designed for deterministic serialization to ensure consistency.

use crate::{
    conflict::Conflict, error::Result, merge::MoneyPolicy, money::MoneyChain, store::FieldMeta,
    EntityId, EntityType, Error, Hlc, LocalDevice, Operation, Record,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// A point-in-time snapshot of the store state.
///
/// Uses BTreeMap instead of HashMap for deterministic serialization order.
/// Hosts that keep the operation log in their own table may leave `ops`
/// empty and fill it back in before restoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub device: LocalDevice,
    /// Last clock value issued or observed
    pub clock: Hlc,
    /// All records including tombstones, by entity type then id
    pub records: BTreeMap<EntityType, BTreeMap<EntityId, Record>>,
    pub field_meta: Vec<FieldMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<Operation>,
    pub conflicts: Vec<Conflict>,
    pub next_conflict_seq: u64,
    pub money_versions: BTreeMap<EntityId, MoneyChain>,
    pub imported_bundles: BTreeSet<String>,
    pub export_cursor: Hlc,
    #[serde(default)]
    pub money_policy: MoneyPolicy,
}

impl StoreSnapshot {
    /// Create a new empty snapshot.
    pub fn new(device: LocalDevice, clock: Hlc) -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            device,
            clock,
            records: BTreeMap::new(),
            field_meta: Vec::new(),
            ops: Vec::new(),
            conflicts: Vec::new(),
            next_conflict_seq: 0,
            money_versions: BTreeMap::new(),
            imported_bundles: BTreeSet::new(),
            export_cursor: Hlc::zero(),
            money_policy: MoneyPolicy::default(),
        }
    }

    /// Add a record to the snapshot.
    pub fn add_record(&mut self, record: Record) {
        self.records
            .entry(record.entity_type.clone())
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get_record(&self, entity_type: &EntityType, id: &str) -> Option<&Record> {
        self.records.get(entity_type)?.get(id)
    }

    /// Count records across all entity types, tombstones included.
    pub fn record_count(&self) -> usize {
        self.records.values().map(|c| c.len()).sum()
    }

    /// Serialize to JSON with deterministic ordering.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Serialize to pretty JSON with deterministic ordering.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
