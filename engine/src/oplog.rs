//! The append-only operation log.
//!
//! Operations are indexed by clock value for range reads and by id for
//! idempotent appends. Nothing is ever removed or rewritten.

use crate::{Hlc, Operation, OperationId};
use std::collections::{BTreeMap, HashMap};

type LogKey = (Hlc, OperationId);

#[derive(Debug, Clone, Default)]
pub struct OpLog {
    ops: BTreeMap<LogKey, Operation>,
    by_id: HashMap<OperationId, LogKey>,
    /// Ids in append order, for hosts that persist incrementally
    appended: Vec<OperationId>,
}

impl OpLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an operation. Returns `false` if its id is already present.
    pub fn append(&mut self, op: Operation) -> bool {
        if self.by_id.contains_key(&op.id) {
            return false;
        }
        let key = (op.hlc.clone(), op.id.clone());
        self.by_id.insert(op.id.clone(), key.clone());
        self.appended.push(op.id.clone());
        self.ops.insert(key, op);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Operation> {
        self.by_id.get(id).and_then(|key| self.ops.get(key))
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// All operations in clock order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.ops.values()
    }

    /// Operations strictly after `cursor`, in clock order.
    pub fn since(&self, cursor: &Hlc) -> impl Iterator<Item = &Operation> {
        let cursor = cursor.clone();
        self.ops
            .range((cursor.clone(), OperationId::new())..)
            .skip_while(move |((hlc, _), _)| *hlc <= cursor)
            .map(|(_, op)| op)
    }

    /// Operations appended after the first `count`, in append order.
    pub fn appended_after(&self, count: usize) -> impl Iterator<Item = &Operation> {
        self.appended
            .iter()
            .skip(count)
            .filter_map(|id| self.get(id))
    }

    /// The highest clock value in the log.
    pub fn latest(&self) -> Option<&Hlc> {
        self.ops.keys().next_back().map(|(hlc, _)| hlc)
    }
}
