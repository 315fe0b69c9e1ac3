//! Store - the in-memory state container.
//!
//! The Store holds the visible records, the operation log, the per-field
//! last-writer index, conflicts and money version chains of one device.
//! Capture, merge, resolution and bundle handling are implemented on it in
//! their own modules.

use crate::{
    conflict::ConflictSet,
    error::Result,
    hlc::{HybridClock, TimeSource},
    merge::MoneyPolicy,
    money::{MoneyChain, MoneyEventVersion, MoneySnapshot},
    oplog::OpLog,
    record::Origin,
    snapshot::{StoreSnapshot, SNAPSHOT_FORMAT_VERSION},
    EntityId, EntityType, Error, Hlc, LocalDevice, NodeId, Operation, OperationId, Record,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// The records of one entity type.
#[derive(Debug, Clone, Default)]
pub struct Collection {
    records: HashMap<EntityId, Record>,
}

impl Collection {
    pub fn new() -> Self {
        Self {
            records: HashMap::new(),
        }
    }

    /// Get a record by ID, including tombstones.
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    pub fn insert(&mut self, record: Record) {
        self.records.insert(record.id.clone(), record);
    }

    /// Check if a record exists (including deleted).
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn active_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|r| r.is_active())
    }

    pub fn all_records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    /// Count of active records.
    pub fn len(&self) -> usize {
        self.active_records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Identifies one field of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub field: String,
}

impl FieldKey {
    pub fn new(entity_type: &EntityType, entity_id: &str, field: &str) -> Self {
        Self {
            entity_type: entity_type.clone(),
            entity_id: entity_id.to_string(),
            field: field.to_string(),
        }
    }
}

/// The operation that last set the visible value of a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMeta {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub field: String,
    pub hlc: Hlc,
    pub op_id: OperationId,
    pub device_id: NodeId,
    pub value: Value,
}

impl FieldMeta {
    fn key(&self) -> FieldKey {
        FieldKey::new(&self.entity_type, &self.entity_id, &self.field)
    }
}

/// The sync state of one device.
#[derive(Debug, Clone)]
pub struct Store {
    pub(crate) device: LocalDevice,
    pub(crate) clock: HybridClock,
    pub(crate) collections: HashMap<EntityType, Collection>,
    pub(crate) log: OpLog,
    pub(crate) field_meta: HashMap<FieldKey, FieldMeta>,
    pub(crate) conflicts: ConflictSet,
    pub(crate) money: HashMap<EntityId, MoneyChain>,
    pub(crate) imported_bundles: BTreeSet<String>,
    /// Highest clock value of local operations already exported
    pub(crate) export_cursor: Hlc,
    pub(crate) money_policy: MoneyPolicy,
}

impl Store {
    /// Create an empty store for a device.
    ///
    /// # Panics
    ///
    /// Panics if the device id is empty.
    pub fn new(device: LocalDevice, time: Arc<dyn TimeSource>) -> Self {
        let clock = HybridClock::new(device.id.clone(), time);

        let collections = EntityType::all()
            .into_iter()
            .map(|t| (t, Collection::new()))
            .collect();

        Self {
            device,
            clock,
            collections,
            log: OpLog::new(),
            field_meta: HashMap::new(),
            conflicts: ConflictSet::new(),
            money: HashMap::new(),
            imported_bundles: BTreeSet::new(),
            export_cursor: Hlc::zero(),
            money_policy: MoneyPolicy::default(),
        }
    }

    /// Set how incoming money changes are merged.
    pub fn with_money_policy(mut self, policy: MoneyPolicy) -> Self {
        self.money_policy = policy;
        self
    }

    pub fn device(&self) -> &LocalDevice {
        &self.device
    }

    pub fn device_id(&self) -> &NodeId {
        &self.device.id
    }

    /// The last clock value issued or observed.
    pub fn clock(&self) -> &Hlc {
        self.clock.last()
    }

    pub fn money_policy(&self) -> MoneyPolicy {
        self.money_policy
    }

    /// Get an active record.
    pub fn get(&self, entity_type: &EntityType, id: &str) -> Option<&Record> {
        self.get_including_deleted(entity_type, id)
            .filter(|r| r.is_active())
    }

    /// Get a record including tombstones.
    pub fn get_including_deleted(&self, entity_type: &EntityType, id: &str) -> Option<&Record> {
        self.collections.get(entity_type).and_then(|c| c.get(id))
    }

    /// Query records of one entity type. `None` for unknown types.
    pub fn query(&self, entity_type: &EntityType) -> Option<QueryBuilder<'_>> {
        self.collections.get(entity_type).map(QueryBuilder::new)
    }

    pub fn collection(&self, entity_type: &EntityType) -> Option<&Collection> {
        self.collections.get(entity_type)
    }

    /// The last writer of a field, if any.
    pub fn field_meta(&self, entity_type: &EntityType, id: &str, field: &str) -> Option<&FieldMeta> {
        self.field_meta.get(&FieldKey::new(entity_type, id, field))
    }

    /// All operations after `cursor`, in clock order.
    pub fn get_ops_since(&self, cursor: &Hlc) -> Vec<&Operation> {
        self.log.since(cursor).collect()
    }

    /// Operations captured on this device after `cursor`, in clock order.
    pub fn get_local_ops_since(&self, cursor: &Hlc) -> Vec<&Operation> {
        self.log
            .since(cursor)
            .filter(|op| op.device_id == self.device.id)
            .collect()
    }

    /// Number of local operations not yet exported.
    pub fn pending_ops_count(&self) -> usize {
        self.log
            .since(&self.export_cursor)
            .filter(|op| op.device_id == self.device.id)
            .count()
    }

    pub fn get_op(&self, id: &str) -> Option<&Operation> {
        self.log.get(id)
    }

    /// Every logged operation in clock order.
    pub fn ops(&self) -> impl Iterator<Item = &Operation> {
        self.log.iter()
    }

    pub fn op_count(&self) -> usize {
        self.log.len()
    }

    /// Operations appended after the first `count`, in append order.
    pub fn ops_appended_after(&self, count: usize) -> impl Iterator<Item = &Operation> {
        self.log.appended_after(count)
    }

    pub fn export_cursor(&self) -> &Hlc {
        &self.export_cursor
    }

    pub fn is_bundle_imported(&self, bundle_id: &str) -> bool {
        self.imported_bundles.contains(bundle_id)
    }

    /// The money version chain of a transaction, oldest first.
    pub fn money_versions(&self, transaction_id: &str) -> &[MoneyEventVersion] {
        self.money
            .get(transaction_id)
            .map(MoneyChain::versions)
            .unwrap_or(&[])
    }

    // ------------------------------------------------------------------
    // Shared mutation helpers for capture, merge and resolution
    // ------------------------------------------------------------------

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.wall_time()
    }

    /// A record that exists and is not deleted.
    pub(crate) fn live_record(&self, entity_type: &EntityType, id: &str) -> Result<&Record> {
        entity_type.ensure_known()?;
        let record = self
            .get_including_deleted(entity_type, id)
            .ok_or_else(|| Error::RecordNotFound(id.to_string()))?;
        if record.deleted {
            return Err(Error::OperationOnDeleted(id.to_string()));
        }
        Ok(record)
    }

    pub(crate) fn money_snapshot(&self, entity_type: &EntityType, id: &str) -> MoneySnapshot {
        self.get_including_deleted(entity_type, id)
            .map(|r| MoneySnapshot::from_payload(&r.payload))
            .unwrap_or_default()
    }

    pub(crate) fn insert_record(&mut self, op: &Operation, record: Record) {
        for (field, value) in &record.payload {
            self.set_meta(op, field, value.clone());
        }
        if op.entity_type.has_money_fields() {
            let snapshot = MoneySnapshot::from_payload(&record.payload);
            self.money.entry(record.id.clone()).or_default().push(
                &record.id,
                snapshot,
                op.hlc.clone(),
                &op.device_id,
                &op.id,
                true,
            );
        }
        if let Some(collection) = self.collections.get_mut(&op.entity_type) {
            collection.insert(record);
        }
    }

    /// Make `value` the visible value of a field and record its writer.
    pub(crate) fn write_field(&mut self, op: &Operation, field: &str, value: Value, origin: Origin) {
        let now = self.now();
        if let Some(record) = self
            .collections
            .get_mut(&op.entity_type)
            .and_then(|c| c.get_mut(&op.entity_id))
        {
            record.set_field(field, value.clone(), now, &op.hlc, origin);
        }
        self.set_meta(op, field, value);
    }

    /// Make `snapshot` the visible money state and the active version.
    pub(crate) fn write_money(&mut self, op: &Operation, snapshot: &MoneySnapshot, origin: Origin) {
        let now = self.now();
        if let Some(record) = self
            .collections
            .get_mut(&op.entity_type)
            .and_then(|c| c.get_mut(&op.entity_id))
        {
            let mut payload = record.payload.clone();
            snapshot.write_to(&mut payload);
            record.replace_payload(payload, now, &op.hlc, origin);
        }
        for field in crate::entity::MoneyField::ALL {
            self.set_meta(op, field.name(), snapshot.get(field));
        }
        self.money.entry(op.entity_id.clone()).or_default().push(
            &op.entity_id,
            snapshot.clone(),
            op.hlc.clone(),
            &op.device_id,
            &op.id,
            true,
        );
    }

    fn set_meta(&mut self, op: &Operation, field: &str, value: Value) {
        let meta = FieldMeta {
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            field: field.to_string(),
            hlc: op.hlc.clone(),
            op_id: op.id.clone(),
            device_id: op.device_id.clone(),
            value,
        };
        self.field_meta.insert(meta.key(), meta);
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Export the complete state as a snapshot.
    pub fn export_state(&self) -> StoreSnapshot {
        let mut snapshot = StoreSnapshot::new(self.device.clone(), self.clock.last().clone());

        for collection in self.collections.values() {
            for record in collection.all_records() {
                snapshot.add_record(record.clone());
            }
        }

        let mut metas: Vec<FieldMeta> = self.field_meta.values().cloned().collect();
        metas.sort_by(|a, b| {
            (&a.entity_type, &a.entity_id, &a.field).cmp(&(&b.entity_type, &b.entity_id, &b.field))
        });
        snapshot.field_meta = metas;

        snapshot.ops = self.log.iter().cloned().collect();
        snapshot.conflicts = self.conflicts.iter().cloned().collect();
        snapshot.next_conflict_seq = self.conflicts.next_seq();
        snapshot.money_versions = self
            .money
            .iter()
            .map(|(id, chain)| (id.clone(), chain.clone()))
            .collect();
        snapshot.imported_bundles = self.imported_bundles.clone();
        snapshot.export_cursor = self.export_cursor.clone();
        snapshot.money_policy = self.money_policy;
        snapshot
    }

    /// Replace the current state with a snapshot of the same device.
    pub fn import_state(&mut self, snapshot: StoreSnapshot) -> Result<()> {
        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }
        if snapshot.device.id != self.device.id {
            return Err(Error::InvalidSnapshot(format!(
                "device ID mismatch: expected '{}', got '{}'",
                self.device.id, snapshot.device.id
            )));
        }
        if snapshot.clock.node_id != self.device.id {
            return Err(Error::InvalidSnapshot(format!(
                "clock belongs to '{}'",
                snapshot.clock.node_id
            )));
        }

        let mut log = OpLog::new();
        for op in snapshot.ops {
            log.append(op);
        }
        // The clock must never fall behind anything already logged.
        let mut last = snapshot.clock;
        if let Some(latest) = log.latest() {
            if latest.physical_time > last.physical_time
                || (latest.physical_time == last.physical_time && latest.counter >= last.counter)
            {
                last = Hlc::new(latest.physical_time, latest.counter, last.node_id);
            }
        }
        self.clock = HybridClock::resume(last, self.clock_time());

        for collection in self.collections.values_mut() {
            collection.records.clear();
        }
        for (entity_type, records) in snapshot.records {
            if let Some(collection) = self.collections.get_mut(&entity_type) {
                for (_, record) in records {
                    collection.insert(record);
                }
            }
        }

        self.device = snapshot.device;
        self.log = log;
        self.field_meta = snapshot
            .field_meta
            .into_iter()
            .map(|m| (m.key(), m))
            .collect();
        self.conflicts = ConflictSet::restore(snapshot.conflicts, snapshot.next_conflict_seq);
        self.money = snapshot.money_versions.into_iter().collect();
        self.imported_bundles = snapshot.imported_bundles;
        self.export_cursor = snapshot.export_cursor;
        self.money_policy = snapshot.money_policy;
        Ok(())
    }

    fn clock_time(&self) -> Arc<dyn TimeSource> {
        self.clock.time_source()
    }
}

/// Builder for querying records of one entity type.
#[derive(Debug)]
pub struct QueryBuilder<'a> {
    collection: &'a Collection,
    include_deleted: bool,
    include_archived: bool,
}

impl<'a> QueryBuilder<'a> {
    fn new(collection: &'a Collection) -> Self {
        Self {
            collection,
            include_deleted: false,
            include_archived: true,
        }
    }

    /// Include deleted records in results.
    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Leave out archived records.
    pub fn exclude_archived(mut self) -> Self {
        self.include_archived = false;
        self
    }

    fn matches(&self, record: &Record) -> bool {
        (self.include_deleted || record.is_active())
            && (self.include_archived || record.field(crate::entity::ARCHIVED_AT).is_null())
    }

    /// All matching records, ordered by id.
    pub fn all(self) -> Vec<&'a Record> {
        let mut records: Vec<_> = self
            .collection
            .all_records()
            .filter(|r| self.matches(r))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn first(self) -> Option<&'a Record> {
        self.all().into_iter().next()
    }

    pub fn count(self) -> usize {
        self.collection
            .all_records()
            .filter(|r| self.matches(r))
            .count()
    }

    /// Filter records by a predicate on the payload.
    pub fn filter<F>(self, predicate: F) -> Vec<&'a Record>
    where
        F: Fn(&serde_json::Map<String, Value>) -> bool,
    {
        let mut records: Vec<_> = self
            .collection
            .all_records()
            .filter(|r| self.matches(r) && predicate(&r.payload))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}
