//! Merging of remote operations.
//!
//! This is the core of convergence. Remote operations are applied in clock
//! order against the local state:
//!
//! 1. Operations already in the log are skipped (idempotency)
//! 2. Malformed operations are skipped and reported, never fatal
//! 3. The local clock observes the remote clock value
//! 4. Plain fields merge with last-writer-wins on the per-field clock
//! 5. Money fields of transactions are versioned; divergent edits open a
//!    money-version conflict and leave the visible money state alone
//! 6. Deletes are absorbing; anything aimed at a tombstone is only logged
//!
//! Every accepted operation is appended to the log, whether or not it
//! changed the visible state, so it can be relayed further.

use crate::{
    conflict::{Candidate, ConflictId, ConflictKey, ConflictStatus, ConflictType},
    entity::{FieldDef, MoneyField, ARCHIVED_AT},
    money::MoneySnapshot,
    record::{iso_timestamp, Origin, Record},
    store::FieldKey,
    EntityType, Hlc, OpType, Operation, OperationId, Store,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

/// How incoming changes to money fields are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MoneyPolicy {
    /// Apply a remote money change when it was made on top of exactly the
    /// money state shown here; divergent changes become conflicts (default)
    #[default]
    FastForward,
    /// Every remote money change that differs from the visible state
    /// becomes a conflict
    ReviewAll,
}

impl std::str::FromStr for MoneyPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "fast-forward" | "fastForward" => Ok(MoneyPolicy::FastForward),
            "review-all" | "reviewAll" => Ok(MoneyPolicy::ReviewAll),
            other => Err(crate::Error::InvalidPayload(format!(
                "unknown money policy: {other}"
            ))),
        }
    }
}

/// Why an operation was skipped without being logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "camelCase")]
pub enum SkipReason {
    UnknownEntityType(String),
    UnknownOpType(String),
    /// The id is not derived from the clock value and device
    IdMismatch,
    MissingField,
    InvalidValue(String),
    /// A change to an entity this device has never seen created
    EntityNotFound,
    /// The operation could not be decoded at all
    Undecodable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnknownEntityType(t) => write!(f, "unknown entity type '{t}'"),
            SkipReason::UnknownOpType(t) => write!(f, "unknown operation type '{t}'"),
            SkipReason::IdMismatch => write!(f, "id does not match clock value and device"),
            SkipReason::MissingField => write!(f, "missing target field"),
            SkipReason::InvalidValue(e) => write!(f, "invalid value: {e}"),
            SkipReason::EntityNotFound => write!(f, "entity not found"),
            SkipReason::Undecodable(e) => write!(f, "undecodable operation: {e}"),
        }
    }
}

/// A malformed operation that was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedOp {
    pub op_id: Option<OperationId>,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// What happened to one remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Logged and reflected in the visible state
    Applied,
    /// Logged, but a newer change or a tombstone already wins
    Superseded,
    /// Logged and opened or extended these conflicts
    Conflicted(Vec<ConflictId>),
    /// Already in the log
    Duplicate,
    /// Skipped and not logged
    Malformed(SkipReason),
}

impl ApplyOutcome {
    /// Whether the operation was accepted into the log.
    pub fn is_logged(&self) -> bool {
        matches!(
            self,
            ApplyOutcome::Applied | ApplyOutcome::Superseded | ApplyOutcome::Conflicted(_)
        )
    }
}

/// Result of merging a batch of operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Operations accepted into the log
    pub applied: usize,
    /// Of those, operations that lost to newer state
    pub superseded: usize,
    /// Duplicates and malformed operations
    pub skipped: usize,
    /// Distinct conflicts opened or extended
    pub conflicts: usize,
    pub conflict_ids: Vec<ConflictId>,
    pub malformed: Vec<SkippedOp>,
}

impl MergeReport {
    pub(crate) fn record(&mut self, op_id: &str, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Superseded => {
                self.applied += 1;
                self.superseded += 1;
            }
            ApplyOutcome::Conflicted(ids) => {
                self.applied += 1;
                for id in ids {
                    if !self.conflict_ids.contains(&id) {
                        self.conflict_ids.push(id);
                    }
                }
                self.conflicts = self.conflict_ids.len();
            }
            ApplyOutcome::Duplicate => self.skipped += 1,
            ApplyOutcome::Malformed(reason) => {
                self.skipped += 1;
                self.malformed.push(SkippedOp {
                    op_id: Some(op_id.to_string()),
                    reason,
                });
            }
        }
    }

    pub(crate) fn record_undecodable(&mut self, skipped: SkippedOp) {
        self.skipped += 1;
        self.malformed.push(skipped);
    }
}

/// A validated remote change.
enum Change {
    Create(Map<String, Value>),
    Fields(Vec<(&'static FieldDef, Value)>),
    Delete,
    Resolve(Option<&'static FieldDef>, Value),
}

#[derive(Default)]
struct Tally {
    applied: bool,
    conflicts: Vec<ConflictId>,
}

impl Tally {
    fn outcome(self) -> ApplyOutcome {
        if !self.conflicts.is_empty() {
            ApplyOutcome::Conflicted(self.conflicts)
        } else if self.applied {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Superseded
        }
    }
}

impl Store {
    /// Merge a batch of remote operations, in clock order.
    pub fn apply_ops(&mut self, mut ops: Vec<Operation>) -> MergeReport {
        ops.sort();
        let mut report = MergeReport::default();
        for op in ops {
            let op_id = op.id.clone();
            let outcome = self.apply_op(op);
            report.record(&op_id, outcome);
        }
        report
    }

    /// Merge one remote operation.
    pub fn apply_op(&mut self, op: Operation) -> ApplyOutcome {
        if self.log.contains(&op.id) {
            return ApplyOutcome::Duplicate;
        }

        let change = match self.check(&op) {
            Ok(change) => change,
            Err(reason) => {
                warn!(op_id = %op.id, %reason, "skipping malformed operation");
                return ApplyOutcome::Malformed(reason);
            }
        };

        self.clock.receive(&op.hlc);
        let outcome = self.merge_change(&op, change);
        debug!(
            op_id = %op.id,
            entity = %op.entity_type,
            entity_id = %op.entity_id,
            op_type = %op.op_type,
            ?outcome,
            "merged remote operation"
        );
        self.log.append(op);
        outcome
    }

    fn check(&self, op: &Operation) -> Result<Change, SkipReason> {
        let entity_type = &op.entity_type;
        if !entity_type.is_known() {
            return Err(SkipReason::UnknownEntityType(entity_type.to_string()));
        }
        if let OpType::Unknown(name) = &op.op_type {
            return Err(SkipReason::UnknownOpType(name.clone()));
        }
        if !op.has_derived_id() {
            return Err(SkipReason::IdMismatch);
        }

        let invalid = |e: crate::Error| SkipReason::InvalidValue(e.to_string());
        if op.op_type == OpType::Create {
            return entity_type
                .validate_create(&op.value)
                .map(Change::Create)
                .map_err(invalid);
        }

        if self
            .get_including_deleted(entity_type, &op.entity_id)
            .is_none()
        {
            return Err(SkipReason::EntityNotFound);
        }

        match &op.op_type {
            OpType::Update => {
                let field = op.field.as_deref().ok_or(SkipReason::MissingField)?;
                let def = entity_type
                    .validate_field(field, &op.value)
                    .map_err(invalid)?;
                Ok(Change::Fields(vec![(def, op.value.clone())]))
            }
            OpType::Delete => Ok(Change::Delete),
            OpType::Archive | OpType::Unarchive => {
                let value = if op.op_type == OpType::Archive {
                    op.value.clone()
                } else {
                    Value::Null
                };
                if !entity_type.is_archivable() {
                    return Err(SkipReason::InvalidValue(format!(
                        "{entity_type} cannot be archived"
                    )));
                }
                let def = entity_type
                    .validate_field(ARCHIVED_AT, &value)
                    .map_err(invalid)?;
                Ok(Change::Fields(vec![(def, value)]))
            }
            OpType::MarkPaid => {
                if *entity_type != EntityType::Transaction {
                    return Err(SkipReason::InvalidValue(format!(
                        "{entity_type} cannot be marked paid"
                    )));
                }
                let status = entity_type
                    .validate_field(MoneyField::Status.name(), &Value::from("paid"))
                    .map_err(invalid)?;
                let paid_at = entity_type
                    .validate_field(MoneyField::PaidAt.name(), &op.value)
                    .map_err(invalid)?;
                Ok(Change::Fields(vec![
                    (status, Value::from("paid")),
                    (paid_at, op.value.clone()),
                ]))
            }
            OpType::ResolveConflict => match op.field.as_deref() {
                Some(field) => {
                    let def = entity_type
                        .validate_field(field, &op.value)
                        .map_err(invalid)?;
                    Ok(Change::Resolve(Some(def), op.value.clone()))
                }
                None => {
                    if !entity_type.has_money_fields() {
                        return Err(SkipReason::MissingField);
                    }
                    let snapshot = MoneySnapshot::from_value(&op.value).map_err(invalid)?;
                    for field in MoneyField::ALL {
                        entity_type
                            .validate_field(field.name(), &snapshot.get(field))
                            .map_err(invalid)?;
                    }
                    Ok(Change::Resolve(None, op.value.clone()))
                }
            },
            OpType::Create | OpType::Unknown(_) => Err(SkipReason::UnknownOpType(
                op.op_type.to_string(),
            )),
        }
    }

    fn merge_change(&mut self, op: &Operation, change: Change) -> ApplyOutcome {
        let deleted = self
            .get_including_deleted(&op.entity_type, &op.entity_id)
            .map(|r| r.deleted);

        match (change, deleted) {
            (Change::Create(payload), None) => {
                let record = Record::new(
                    op.entity_id.clone(),
                    op.entity_type.clone(),
                    payload,
                    self.now(),
                    op.hlc.clone(),
                    Origin::Remote,
                );
                self.insert_record(op, record);
                ApplyOutcome::Applied
            }
            (_, Some(true)) => ApplyOutcome::Superseded,
            (Change::Create(payload), Some(false)) => {
                let changes = payload
                    .into_iter()
                    .filter_map(|(name, value)| op.entity_type.field(&name).map(|d| (d, value)))
                    .collect();
                self.merge_fields(op, changes)
            }
            (Change::Fields(changes), _) => self.merge_fields(op, changes),
            (Change::Delete, _) => {
                let now = self.now();
                if let Some(record) = self
                    .collections
                    .get_mut(&op.entity_type)
                    .and_then(|c| c.get_mut(&op.entity_id))
                {
                    record.mark_deleted(now, &op.hlc, Origin::Remote);
                }
                ApplyOutcome::Applied
            }
            (Change::Resolve(field, value), _) => self.merge_resolution(op, field, value),
        }
    }

    fn merge_fields(&mut self, op: &Operation, changes: Vec<(&'static FieldDef, Value)>) -> ApplyOutcome {
        let mut tally = Tally::default();
        let mut money = Vec::new();

        for (def, value) in changes {
            if let Some(field) = def.money_field() {
                money.push((field, value));
                continue;
            }
            match self.merge_plain_field(op, def, value) {
                ApplyOutcome::Applied => tally.applied = true,
                ApplyOutcome::Conflicted(ids) => {
                    tally.applied = true;
                    tally.conflicts.extend(ids);
                }
                _ => {}
            }
        }

        if !money.is_empty() {
            match self.merge_money(op, &money) {
                ApplyOutcome::Applied => tally.applied = true,
                ApplyOutcome::Conflicted(ids) => {
                    tally.applied = true;
                    tally.conflicts.extend(ids);
                }
                _ => {}
            }
        }

        tally.outcome()
    }

    /// Last-writer-wins on one plain field. A tie on the clock between two
    /// devices is settled by device id and recorded for audit.
    fn merge_plain_field(&mut self, op: &Operation, def: &FieldDef, value: Value) -> ApplyOutcome {
        let key = FieldKey::new(&op.entity_type, &op.entity_id, def.name);
        let Some(meta) = self.field_meta.get(&key).cloned() else {
            self.write_field(op, def.name, value, Origin::Remote);
            return ApplyOutcome::Applied;
        };

        let tie = meta.hlc.physical_time == op.hlc.physical_time
            && meta.hlc.counter == op.hlc.counter
            && meta.device_id != op.device_id
            && meta.value != value;
        let newer = op.hlc > meta.hlc;

        let conflict = if tie {
            let local = Candidate {
                value: meta.value,
                hlc: meta.hlc,
                device_id: meta.device_id,
                op_id: Some(meta.op_id),
            };
            let now = self.now();
            Some(self.conflicts.record(
                ConflictKey {
                    entity_type: op.entity_type.clone(),
                    entity_id: op.entity_id.clone(),
                    field: Some(def.name.to_string()),
                },
                ConflictType::FieldLww,
                vec![local, remote_candidate(op, value.clone())],
                now,
            ))
        } else {
            None
        };

        if newer {
            self.write_field(op, def.name, value, Origin::Remote);
        }

        match (conflict, newer) {
            (Some(id), _) => ApplyOutcome::Conflicted(vec![id]),
            (None, true) => ApplyOutcome::Applied,
            (None, false) => ApplyOutcome::Superseded,
        }
    }

    /// Money fields never merge blindly. The remote money state either
    /// fast-forwards the visible one, matches it, or becomes a candidate
    /// in a money-version conflict.
    fn merge_money(&mut self, op: &Operation, changes: &[(MoneyField, Value)]) -> ApplyOutcome {
        let visible = self.money_snapshot(&op.entity_type, &op.entity_id);
        let incoming = match &op.money_version {
            Some(change) => change.after.clone(),
            None => changes
                .iter()
                .fold(visible.clone(), |s, (field, value)| s.with(*field, value)),
        };

        let chain = self.money.entry(op.entity_id.clone()).or_default();
        if chain.has_newer_from(&op.device_id, &op.hlc) {
            return ApplyOutcome::Superseded;
        }
        if incoming == visible {
            return ApplyOutcome::Applied;
        }

        let based_on_visible = match &op.money_version {
            Some(change) => change.before == visible,
            None => chain
                .active()
                .map_or(true, |v| v.device_id != self.device.id),
        };
        if based_on_visible && self.money_policy == MoneyPolicy::FastForward {
            self.write_money(op, &incoming, Origin::Remote);
            return ApplyOutcome::Applied;
        }

        let local = match chain.active() {
            Some(v) => Candidate {
                value: visible.to_value(),
                hlc: v.hlc.clone(),
                device_id: v.device_id.clone(),
                op_id: Some(v.op_id.clone()),
            },
            None => Candidate {
                value: visible.to_value(),
                hlc: Hlc::zero(),
                device_id: self.device.id.clone(),
                op_id: None,
            },
        };
        chain.push(
            &op.entity_id,
            incoming.clone(),
            op.hlc.clone(),
            &op.device_id,
            &op.id,
            false,
        );

        let now = self.now();
        let id = self.conflicts.record(
            ConflictKey {
                entity_type: op.entity_type.clone(),
                entity_id: op.entity_id.clone(),
                field: None,
            },
            ConflictType::MoneyVersion,
            vec![local, remote_candidate(op, incoming.to_value())],
            now,
        );
        debug!(
            conflict_id = %id,
            entity_id = %op.entity_id,
            fields = ?visible.changed_fields(&incoming),
            "money versions diverged"
        );
        ApplyOutcome::Conflicted(vec![id])
    }

    /// Conflict resolutions are ordered by clock like any other write, and
    /// close the local conflict on the same key once they outrank every
    /// candidate and the resolved value is what is shown.
    fn merge_resolution(
        &mut self,
        op: &Operation,
        field: Option<&'static FieldDef>,
        value: Value,
    ) -> ApplyOutcome {
        let fields: Vec<&str> = match field {
            Some(def) => vec![def.name],
            None => MoneyField::ALL.iter().map(|f| f.name()).collect(),
        };
        let newest_meta = fields
            .iter()
            .filter_map(|f| {
                self.field_meta
                    .get(&FieldKey::new(&op.entity_type, &op.entity_id, f))
            })
            .map(|m| &m.hlc)
            .max()
            .cloned();

        let mut applied = false;
        if newest_meta.map_or(true, |hlc| op.hlc > hlc) {
            match field {
                Some(def) => self.write_field(op, def.name, value.clone(), Origin::Remote),
                None => {
                    if let Ok(snapshot) = MoneySnapshot::from_value(&value) {
                        self.write_money(op, &snapshot, Origin::Remote);
                    }
                }
            }
            applied = true;
        }

        // A newer local edit keeps the conflict open
        let shown = match field {
            Some(def) => self
                .get(&op.entity_type, &op.entity_id)
                .is_some_and(|r| *r.field(def.name) == value),
            None => MoneySnapshot::from_value(&value)
                .is_ok_and(|s| s == self.money_snapshot(&op.entity_type, &op.entity_id)),
        };

        let key = ConflictKey {
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            field: field.map(|d| d.name.to_string()),
        };
        let closable = self
            .conflicts
            .open_for(&key)
            .filter(|c| shown && c.candidates.iter().all(|cand| cand.hlc < op.hlc))
            .map(|c| c.id.clone());
        if let Some(id) = closable {
            if let Some(conflict) = self.conflicts.get_mut(&id) {
                conflict.status = ConflictStatus::Resolved;
                conflict.resolution = Some(crate::conflict::ConflictResolution {
                    value,
                    op_id: op.id.clone(),
                    resolved_by: op.device_id.clone(),
                    resolved_at: iso_timestamp(op.local_created_at),
                });
            }
            debug!(conflict_id = %id, op_id = %op.id, "conflict closed by remote resolution");
            applied = true;
        }

        if applied {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Superseded
        }
    }
}

fn remote_candidate(op: &Operation, value: Value) -> Candidate {
    Candidate {
        value,
        hlc: op.hlc.clone(),
        device_id: op.device_id.clone(),
        op_id: Some(op.id.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hlc::ManualTime, LocalDevice};
    use serde_json::json;
    use std::sync::Arc;

    fn device(id: &str, start: i64) -> (Store, ManualTime) {
        let time = ManualTime::new(start);
        let store = Store::new(
            LocalDevice::new(id, id, "2024-01-01T00:00:00.000Z"),
            Arc::new(time.clone()),
        );
        (store, time)
    }

    fn transaction() -> Value {
        json!({
            "kind": "income",
            "status": "unpaid",
            "amountMinor": 10000,
            "currency": "USD",
            "occurredAt": "2024-02-01"
        })
    }

    /// Copy every operation of `from` that `to` has not seen.
    fn sync(from: &Store, to: &mut Store) -> MergeReport {
        let ops: Vec<Operation> = from.ops().cloned().collect();
        to.apply_ops(ops)
    }

    #[test]
    fn duplicate_is_skipped() {
        let (mut a, _) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        let op = a
            .capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();

        assert_eq!(b.apply_op(op.clone()), ApplyOutcome::Applied);
        assert_eq!(b.apply_op(op), ApplyOutcome::Duplicate);
        assert_eq!(b.op_count(), 1);
    }

    #[test]
    fn remote_create_and_update() {
        let (mut a, time) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        a.capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();
        time.advance(5);
        a.capture_update(EntityType::Client, "c-1", json!({"email": "hi@acme.test"}))
            .unwrap();

        let report = sync(&a, &mut b);
        assert_eq!(report.applied, 2);
        assert_eq!(report.skipped, 0);

        let record = b.get(&EntityType::Client, "c-1").unwrap();
        assert_eq!(record.field("email"), "hi@acme.test");
        assert_eq!(record.metadata.origin, Origin::Remote);
        let latest = a.ops().last().map(|op| op.hlc.clone()).unwrap();
        assert!(*b.clock() > latest);
        assert_eq!(b.pending_ops_count(), 0);
    }

    #[test]
    fn older_plain_write_is_superseded() {
        let (mut a, _) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 5000);
        a.capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();
        sync(&a, &mut b);

        let old = a
            .capture_update(EntityType::Client, "c-1", json!({"notes": "from a"}))
            .unwrap();
        b.capture_update(EntityType::Client, "c-1", json!({"notes": "from b"}))
            .unwrap();

        assert_eq!(b.apply_op(old[0].clone()), ApplyOutcome::Superseded);
        assert_eq!(
            b.get(&EntityType::Client, "c-1").unwrap().field("notes"),
            "from b"
        );
        assert!(b.get_op(&old[0].id).is_some());
    }

    #[test]
    fn equal_clock_tie_goes_to_higher_device_and_is_audited() {
        let (mut a, _) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        a.capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();
        sync(&a, &mut b);

        // Both clocks sit at (1000, 0..1); force both writes onto the same tick.
        let hlc_a = Hlc::new(2000, 0, "dev-a");
        let hlc_b = Hlc::new(2000, 0, "dev-b");
        let op_a = Operation::new(
            EntityType::Client,
            "c-1",
            OpType::Update,
            json!("A"),
            hlc_a,
            "dev-a",
            2000,
        )
        .with_field("notes", Value::Null);
        let op_b = Operation::new(
            EntityType::Client,
            "c-1",
            OpType::Update,
            json!("B"),
            hlc_b,
            "dev-b",
            2000,
        )
        .with_field("notes", Value::Null);

        a.apply_op(op_a.clone());
        let outcome_a = a.apply_op(op_b.clone());
        b.apply_op(op_b);
        let outcome_b = b.apply_op(op_a);

        assert!(matches!(outcome_a, ApplyOutcome::Conflicted(_)));
        assert!(matches!(outcome_b, ApplyOutcome::Conflicted(_)));
        for store in [&a, &b] {
            assert_eq!(
                store.get(&EntityType::Client, "c-1").unwrap().field("notes"),
                "B"
            );
            let open = store.open_conflicts(None);
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].conflict_type, ConflictType::FieldLww);
            assert_eq!(open[0].candidates.len(), 2);
        }
    }

    #[test]
    fn malformed_ops_are_reported_not_logged() {
        let (mut a, _) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        let create = a
            .capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();

        let mut unknown_type = create.clone();
        unknown_type.entity_type = EntityType::Unknown("widget".into());

        let mut forged = create.clone();
        forged.device_id = "dev-z".into();

        let mut orphan = a
            .capture_update(EntityType::Client, "c-1", json!({"notes": "x"}))
            .unwrap()
            .remove(0);
        orphan.entity_id = "c-404".into();
        orphan.id = Operation::derive_id(&orphan.hlc, &orphan.device_id);

        let mut bad_value = create.clone();
        bad_value.op_type = OpType::Update;
        bad_value.field = Some("name".into());
        bad_value.value = json!(42);
        bad_value.hlc = Hlc::new(create.hlc.physical_time + 1, 0, "dev-a");
        bad_value.id = Operation::derive_id(&bad_value.hlc, "dev-a");

        let clock_before = b.clock().clone();
        let report = b.apply_ops(vec![unknown_type, forged, orphan]);
        assert_eq!(report.applied, 0);
        assert_eq!(report.skipped, 3);
        assert_eq!(report.malformed.len(), 3);
        assert_eq!(b.op_count(), 0);
        assert_eq!(b.clock(), &clock_before);

        b.apply_op(create);
        assert!(matches!(
            b.apply_op(bad_value),
            ApplyOutcome::Malformed(SkipReason::InvalidValue(_))
        ));
    }

    #[test]
    fn sequential_money_edits_fast_forward() {
        let (mut a, time) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        a.capture_create(EntityType::Transaction, "tx-1", transaction())
            .unwrap();
        time.advance(10);
        a.capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 12000}))
            .unwrap();
        time.advance(10);
        a.capture_mark_paid("tx-1", Some("2024-02-03")).unwrap();

        let report = sync(&a, &mut b);
        assert_eq!(report.conflicts, 0);
        let record = b.get(&EntityType::Transaction, "tx-1").unwrap();
        assert_eq!(record.field("amountMinor"), 12000);
        assert_eq!(record.field("status"), "paid");
        assert_eq!(b.money_versions("tx-1").len(), 3);
    }

    #[test]
    fn divergent_money_edits_conflict_on_both_sides() {
        let (mut a, time_a) = device("dev-a", 1000);
        let (mut b, time_b) = device("dev-b", 1000);
        a.capture_create(EntityType::Transaction, "tx-1", transaction())
            .unwrap();
        sync(&a, &mut b);

        time_a.advance(10);
        time_b.advance(20);
        a.capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 15000}))
            .unwrap();
        b.capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 20000}))
            .unwrap();

        let report_a = sync(&b, &mut a);
        let report_b = sync(&a, &mut b);
        assert_eq!(report_a.conflicts, 1);
        assert_eq!(report_b.conflicts, 1);

        assert_eq!(
            a.get(&EntityType::Transaction, "tx-1").unwrap().field("amountMinor"),
            15000
        );
        assert_eq!(
            b.get(&EntityType::Transaction, "tx-1").unwrap().field("amountMinor"),
            20000
        );
        for store in [&a, &b] {
            let open = store.open_conflicts(None);
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].conflict_type, ConflictType::MoneyVersion);
            assert_eq!(open[0].field, None);
            let amounts: Vec<_> = open[0]
                .candidates
                .iter()
                .map(|c| c.value["amountMinor"].clone())
                .collect();
            assert!(amounts.contains(&json!(15000)));
            assert!(amounts.contains(&json!(20000)));
        }
        // The losing remote version is kept, inactive
        let versions = a.money_versions("tx-1");
        assert_eq!(versions.len(), 3);
        assert_eq!(versions.iter().filter(|v| v.active).count(), 1);
        assert!(versions.last().map_or(false, |v| !v.active));
    }

    #[test]
    fn review_all_policy_conflicts_even_on_fast_forward() {
        let (mut a, time) = device("dev-a", 1000);
        let (b, _) = device("dev-b", 1000);
        let mut b = b.with_money_policy(MoneyPolicy::ReviewAll);
        a.capture_create(EntityType::Transaction, "tx-1", transaction())
            .unwrap();
        sync(&a, &mut b);
        time.advance(10);
        a.capture_mark_paid("tx-1", Some("2024-02-03")).unwrap();

        let report = sync(&a, &mut b);
        assert_eq!(report.conflicts, 1);
        assert_eq!(
            b.get(&EntityType::Transaction, "tx-1").unwrap().field("status"),
            "unpaid"
        );
    }

    fn unstamped_amount(from: &str, amount: i64, at: i64) -> Operation {
        Operation::new(
            EntityType::Transaction,
            "tx-1",
            OpType::Update,
            json!(amount),
            Hlc::new(at, 0, from),
            from,
            at,
        )
        .with_field("amountMinor", json!(10000))
    }

    #[test]
    fn unstamped_money_edit_fast_forwards_remote_version() {
        let (mut a, _) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        a.capture_create(EntityType::Transaction, "tx-1", transaction())
            .unwrap();
        sync(&a, &mut b);

        let op = unstamped_amount("dev-a", 12000, 5000);
        assert!(op.money_version.is_none());
        assert_eq!(b.apply_op(op), ApplyOutcome::Applied);
        assert_eq!(
            b.get(&EntityType::Transaction, "tx-1").unwrap().field("amountMinor"),
            12000
        );
        assert_eq!(b.open_conflicts_count(), 0);
        let active = b.money_versions("tx-1").iter().find(|v| v.active).cloned();
        assert_eq!(active.map(|v| v.snapshot.amount_minor), Some(Some(12000)));
    }

    #[test]
    fn unstamped_money_edit_conflicts_with_local_version() {
        let (mut b, _) = device("dev-b", 1000);
        b.capture_create(EntityType::Transaction, "tx-1", transaction())
            .unwrap();

        let outcome = b.apply_op(unstamped_amount("dev-a", 12000, 5000));
        assert!(matches!(outcome, ApplyOutcome::Conflicted(_)));
        assert_eq!(
            b.get(&EntityType::Transaction, "tx-1").unwrap().field("amountMinor"),
            10000
        );
        let open = b.open_conflicts(None);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].conflict_type, ConflictType::MoneyVersion);
        assert_eq!(b.money_versions("tx-1").len(), 2);
    }

    #[test]
    fn remote_resolution_leaves_conflict_open_under_newer_local_edit() {
        let (mut a, time_a) = device("dev-a", 1000);
        let (mut b, time_b) = device("dev-b", 1000);
        a.capture_create(EntityType::Transaction, "tx-1", transaction())
            .unwrap();
        sync(&a, &mut b);

        time_a.advance(10);
        time_b.advance(20);
        a.capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 15000}))
            .unwrap();
        b.capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 20000}))
            .unwrap();
        sync(&b, &mut a);
        sync(&a, &mut b);

        let conflict = a.open_conflicts(None)[0].clone();
        let pick = conflict
            .candidates
            .iter()
            .position(|c| c.value["amountMinor"] == 15000)
            .unwrap();
        a.resolve_conflict(&conflict.id, crate::Resolution::Candidate(pick))
            .unwrap();

        // b moves on before hearing about the resolution
        time_b.advance(1_000);
        b.capture_update(EntityType::Transaction, "tx-1", json!({"amountMinor": 25000}))
            .unwrap();
        sync(&a, &mut b);

        assert_eq!(
            b.get(&EntityType::Transaction, "tx-1").unwrap().field("amountMinor"),
            25000
        );
        let open = b.open_conflicts(None);
        assert_eq!(open.len(), 1);
        assert!(open[0].resolution.is_none());
        assert_eq!(a.open_conflicts_count(), 0);
    }

    #[test]
    fn delete_is_absorbing() {
        let (mut a, time) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        a.capture_create(EntityType::Project, "p-1", json!({"name": "Site"}))
            .unwrap();
        sync(&a, &mut b);

        b.capture_delete(EntityType::Project, "p-1").unwrap();
        time.advance(1_000);
        let later = a
            .capture_update(EntityType::Project, "p-1", json!({"name": "Site v2"}))
            .unwrap();

        assert_eq!(b.apply_op(later[0].clone()), ApplyOutcome::Superseded);
        assert!(b.get(&EntityType::Project, "p-1").is_none());

        sync(&b, &mut a);
        assert!(a.get(&EntityType::Project, "p-1").is_none());
    }

    #[test]
    fn apply_ops_sorts_by_clock() {
        let (mut a, time) = device("dev-a", 1000);
        let (mut b, _) = device("dev-b", 1000);
        a.capture_create(EntityType::Client, "c-1", json!({"name": "Acme"}))
            .unwrap();
        time.advance(1);
        a.capture_update(EntityType::Client, "c-1", json!({"name": "Acme Ltd"}))
            .unwrap();

        let mut ops: Vec<Operation> = a.ops().cloned().collect();
        ops.reverse();
        let report = b.apply_ops(ops);
        assert_eq!(report.applied, 2);
        assert_eq!(
            b.get(&EntityType::Client, "c-1").unwrap().field("name"),
            "Acme Ltd"
        );
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_concurrent_plain_edits_converge(
                skew_a in 0i64..5_000,
                skew_b in 0i64..5_000,
                edits_a in proptest::collection::vec("[a-z]{1,6}", 1..4),
                edits_b in proptest::collection::vec("[a-z]{1,6}", 1..4),
            ) {
                let (mut a, time_a) = device("dev-a", 1_000);
                let (mut b, time_b) = device("dev-b", 1_000);
                a.capture_create(EntityType::Client, "c-1", json!({"name": "Acme"})).unwrap();
                sync(&a, &mut b);

                time_a.advance(skew_a);
                time_b.advance(skew_b);
                for note in &edits_a {
                    a.capture_update(EntityType::Client, "c-1", json!({"notes": note})).unwrap();
                }
                for note in &edits_b {
                    b.capture_update(EntityType::Client, "c-1", json!({"notes": note})).unwrap();
                }

                let from_a: Vec<Operation> = a.ops().cloned().collect();
                let from_b: Vec<Operation> = b.ops().cloned().collect();
                a.apply_ops(from_b);
                b.apply_ops(from_a);

                let notes_a = a.get(&EntityType::Client, "c-1").unwrap().field("notes").clone();
                let notes_b = b.get(&EntityType::Client, "c-1").unwrap().field("notes").clone();
                prop_assert_eq!(notes_a, notes_b);
                prop_assert_eq!(a.op_count(), b.op_count());
            }
        }
    }
}
