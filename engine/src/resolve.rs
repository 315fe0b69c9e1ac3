//! Conflict resolution API.
//!
//! Resolving a conflict is a tracked mutation like any other: it appends a
//! `resolveConflict` operation, so the decision travels in the next bundle
//! and closes the same conflict on other devices.

use crate::{
    conflict::{Conflict, ConflictResolution, ConflictStatus, ConflictSummary, ConflictType},
    entity::MoneyField,
    error::Result,
    money::MoneySnapshot,
    record::{iso_timestamp, Origin},
    EntityType, Error, OpType, Operation, Store,
};
use serde_json::Value;
use tracing::info;

/// The value a conflict is resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// One of the conflict's candidates, by index
    Candidate(usize),
    /// A manually entered money snapshot (money conflicts only)
    Manual(Value),
}

impl Store {
    /// All conflicts, open and resolved, in creation order.
    pub fn conflicts(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter()
    }

    pub fn conflict(&self, id: &str) -> Option<&Conflict> {
        self.conflicts.get(id)
    }

    /// Open conflicts, optionally only those of one entity.
    pub fn open_conflicts(&self, scope: Option<(&EntityType, &str)>) -> Vec<&Conflict> {
        self.conflicts
            .open()
            .filter(|c| match scope {
                Some((entity_type, id)) => c.entity_type == *entity_type && c.entity_id == id,
                None => true,
            })
            .collect()
    }

    pub fn open_conflicts_count(&self) -> usize {
        self.conflicts.open().count()
    }

    pub fn conflict_summary(&self) -> ConflictSummary {
        self.conflicts.summary()
    }

    /// Resolve an open conflict and record the decision as an operation.
    pub fn resolve_conflict(&mut self, id: &str, resolution: Resolution) -> Result<Operation> {
        let conflict = self
            .conflicts
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        if !conflict.is_open() {
            return Err(Error::ConflictAlreadyResolved(id.to_string()));
        }

        let value = match resolution {
            Resolution::Candidate(index) => conflict
                .candidates
                .get(index)
                .map(|c| c.value.clone())
                .ok_or_else(|| {
                    Error::InvalidResolution(format!("{id} has no candidate {index}"))
                })?,
            Resolution::Manual(value) => {
                if conflict.conflict_type != ConflictType::MoneyVersion {
                    return Err(Error::InvalidResolution(
                        "manual values are only accepted for money conflicts".into(),
                    ));
                }
                value
            }
        };

        let entity_type = conflict.entity_type.clone();
        let entity_id = conflict.entity_id.as_str();
        let previous = self.live_record(&entity_type, entity_id)?;

        let op = match conflict.field.as_deref() {
            Some(field) => {
                let def = entity_type.validate_field(field, &value)?;
                let previous = previous.field(def.name).clone();
                let op = self
                    .local_op(entity_type, entity_id, OpType::ResolveConflict, value.clone())
                    .with_field(def.name, previous);
                self.write_field(&op, def.name, value, Origin::Local);
                op
            }
            None => {
                let snapshot = money_resolution(&entity_type, &value)?;
                let before = self.money_snapshot(&entity_type, entity_id);
                let op = self
                    .local_op(
                        entity_type,
                        entity_id,
                        OpType::ResolveConflict,
                        snapshot.to_value(),
                    )
                    .with_money(before, snapshot.clone());
                self.write_money(&op, &snapshot, Origin::Local);
                op
            }
        };

        if let Some(conflict) = self.conflicts.get_mut(id) {
            conflict.status = ConflictStatus::Resolved;
            conflict.resolution = Some(ConflictResolution {
                value: op.value.clone(),
                op_id: op.id.clone(),
                resolved_by: op.device_id.clone(),
                resolved_at: iso_timestamp(op.local_created_at),
            });
        }
        info!(conflict_id = %id, op_id = %op.id, "conflict resolved");
        Ok(self.commit(op))
    }

    /// Accept the newest candidate of every open conflict.
    ///
    /// Conflicts on entities that were deleted in the meantime are left
    /// open.
    pub fn resolve_all_conflicts(&mut self) -> Result<Vec<Operation>> {
        let pending: Vec<(String, usize)> = self
            .conflicts
            .open()
            .filter(|c| self.get(&c.entity_type, &c.entity_id).is_some())
            .filter_map(|c| c.newest_candidate().map(|(index, _)| (c.id.clone(), index)))
            .collect();

        let mut ops = Vec::with_capacity(pending.len());
        for (id, index) in pending {
            ops.push(self.resolve_conflict(&id, Resolution::Candidate(index))?);
        }
        Ok(ops)
    }
}

fn money_resolution(entity_type: &EntityType, value: &Value) -> Result<MoneySnapshot> {
    let snapshot = MoneySnapshot::from_value(value)
        .map_err(|e| Error::InvalidResolution(e.to_string()))?;
    for field in MoneyField::ALL {
        entity_type.validate_field(field.name(), &snapshot.get(field))?;
    }
    Ok(snapshot)
}
