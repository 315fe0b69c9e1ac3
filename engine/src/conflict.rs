//! Conflict records.
//!
//! A conflict is opened when the merge engine cannot, or must not, pick a
//! value on its own. At most one conflict is open per key: a field of an
//! entity for last-writer-wins audits, or a whole transaction for money
//! versions. Later divergent values join the open conflict as candidates.

use crate::{EntityId, EntityType, Hlc, NodeId, OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Local identifier of a conflict, `"conflict-<n>"`.
pub type ConflictId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// Two writes carried the same clock value; the tiebreak picked one
    #[serde(rename = "field-lww")]
    FieldLww,
    /// Money fields of a transaction diverged between devices
    #[serde(rename = "money-version")]
    MoneyVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

/// One of the competing values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    /// The field value, or a money snapshot for money conflicts
    pub value: Value,
    pub hlc: Hlc,
    pub device_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<OperationId>,
}

/// How a conflict was closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub value: Value,
    /// The `resolveConflict` operation that carried the decision
    pub op_id: OperationId,
    pub resolved_by: NodeId,
    /// RFC 3339
    pub resolved_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: ConflictId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// `None` for money-version conflicts, which cover the whole transaction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub conflict_type: ConflictType,
    pub candidates: Vec<Candidate>,
    pub status: ConflictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
    pub created_at: Timestamp,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Open
    }

    pub fn key(&self) -> ConflictKey {
        ConflictKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            field: self.field.clone(),
        }
    }

    /// The candidate with the highest clock value.
    pub fn newest_candidate(&self) -> Option<(usize, &Candidate)> {
        self.candidates
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.hlc.cmp(&b.hlc))
    }

    /// Add a candidate. A newer candidate from the same device replaces the
    /// older one; an identical value is not added twice.
    fn merge_candidate(&mut self, candidate: Candidate) {
        if let Some(existing) = self
            .candidates
            .iter_mut()
            .find(|c| c.device_id == candidate.device_id)
        {
            if candidate.hlc > existing.hlc {
                *existing = candidate;
            }
        } else if !self.candidates.iter().any(|c| c.value == candidate.value) {
            self.candidates.push(candidate);
        }
    }
}

/// What a conflict is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConflictKey {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub field: Option<String>,
}

/// Counts of conflicts, for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub open: usize,
    pub resolved: usize,
    pub open_field_lww: usize,
    pub open_money_version: usize,
    /// Open conflicts per entity type
    pub open_by_entity: BTreeMap<String, usize>,
}

/// All conflicts of a store, in creation order.
#[derive(Debug, Clone, Default)]
pub struct ConflictSet {
    conflicts: Vec<Conflict>,
    next_seq: u64,
}

impl ConflictSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn restore(conflicts: Vec<Conflict>, next_seq: u64) -> Self {
        Self {
            conflicts,
            next_seq,
        }
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn iter(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter()
    }

    pub fn open(&self) -> impl Iterator<Item = &Conflict> {
        self.conflicts.iter().filter(|c| c.is_open())
    }

    pub fn get(&self, id: &str) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: &str) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == id)
    }

    pub fn open_for(&self, key: &ConflictKey) -> Option<&Conflict> {
        self.open().find(|c| c.key() == *key)
    }

    /// Record divergent candidates for a key, extending the open conflict
    /// if there is one. Returns the conflict id.
    pub(crate) fn record(
        &mut self,
        key: ConflictKey,
        conflict_type: ConflictType,
        candidates: Vec<Candidate>,
        now: Timestamp,
    ) -> ConflictId {
        if let Some(conflict) = self
            .conflicts
            .iter_mut()
            .find(|c| c.is_open() && c.key() == key)
        {
            for candidate in candidates {
                conflict.merge_candidate(candidate);
            }
            return conflict.id.clone();
        }

        self.next_seq += 1;
        let mut conflict = Conflict {
            id: format!("conflict-{}", self.next_seq),
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            field: key.field,
            conflict_type,
            candidates: Vec::new(),
            status: ConflictStatus::Open,
            resolution: None,
            created_at: now,
        };
        for candidate in candidates {
            conflict.merge_candidate(candidate);
        }
        let id = conflict.id.clone();
        self.conflicts.push(conflict);
        id
    }

    pub fn summary(&self) -> ConflictSummary {
        let mut summary = ConflictSummary::default();
        for conflict in &self.conflicts {
            if !conflict.is_open() {
                summary.resolved += 1;
                continue;
            }
            summary.open += 1;
            match conflict.conflict_type {
                ConflictType::FieldLww => summary.open_field_lww += 1,
                ConflictType::MoneyVersion => summary.open_money_version += 1,
            }
            *summary
                .open_by_entity
                .entry(conflict.entity_type.to_string())
                .or_default() += 1;
        }
        summary
    }
}
