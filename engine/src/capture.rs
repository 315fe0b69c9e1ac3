//! Capture of local changes.
//!
//! Every mutating business operation goes through one of these methods.
//! Each call validates its input first, then ticks the clock, appends the
//! operation(s) and updates the visible state, so the log and the records
//! can never disagree. A failed validation leaves the store untouched.

use crate::{
    entity::{FieldKind, MoneyField, ARCHIVED_AT},
    error::Result,
    record::{iso_timestamp, Origin},
    EntityId, EntityType, Error, Operation, OpType, Record, Store,
};
use serde_json::Value;
use tracing::debug;

impl Store {
    /// Record the creation of an entity.
    ///
    /// System fields in the payload are ignored; the entity id must be new,
    /// including ids of deleted entities.
    pub fn capture_create(
        &mut self,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        payload: Value,
    ) -> Result<Operation> {
        let entity_id = entity_id.into();
        entity_type.ensure_known()?;
        if entity_id.is_empty() {
            return Err(Error::InvalidPayload("entity id must not be empty".into()));
        }
        if self.get_including_deleted(&entity_type, &entity_id).is_some() {
            return Err(Error::RecordAlreadyExists(entity_id));
        }
        let clean = entity_type.validate_create(&payload)?;

        let mut op = self.local_op(
            entity_type.clone(),
            &entity_id,
            OpType::Create,
            Value::Object(clean.clone()),
        );
        if entity_type.has_money_fields() {
            op = op.with_money(
                Default::default(),
                crate::MoneySnapshot::from_payload(&clean),
            );
        }

        let record = Record::new(
            entity_id,
            entity_type,
            clean,
            op.local_created_at,
            op.hlc.clone(),
            Origin::Local,
        );
        self.insert_record(&op, record);
        Ok(self.commit(op))
    }

    /// Record changes to some fields of an entity.
    ///
    /// Emits one operation per changed field. Unchanged fields and system
    /// fields emit nothing; `null` clears an optional field.
    pub fn capture_update(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        changes: Value,
    ) -> Result<Vec<Operation>> {
        let record = self.live_record(&entity_type, entity_id)?;
        let changes = changes
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("changes must be an object".into()))?;

        let mut pending = Vec::new();
        for (name, value) in changes {
            if entity_type
                .field(name)
                .is_some_and(|def| def.kind == FieldKind::System)
            {
                continue;
            }
            let def = entity_type.validate_field(name, value)?;
            if record.field(name) != value {
                pending.push((def, value.clone()));
            }
        }

        let mut ops = Vec::with_capacity(pending.len());
        for (def, value) in pending {
            let previous = self
                .get_including_deleted(&entity_type, entity_id)
                .map(|r| r.field(def.name).clone())
                .unwrap_or(Value::Null);
            let op = self
                .local_op(entity_type.clone(), entity_id, OpType::Update, value.clone())
                .with_field(def.name, previous);

            let op = match def.money_field() {
                Some(field) => self.capture_money(op, &[(field, value)]),
                None => {
                    self.write_field(&op, def.name, value, Origin::Local);
                    op
                }
            };
            ops.push(self.commit(op));
        }
        Ok(ops)
    }

    /// Record the deletion of an entity. Deletes are tombstones.
    pub fn capture_delete(&mut self, entity_type: EntityType, entity_id: &str) -> Result<Operation> {
        self.live_record(&entity_type, entity_id)?;
        let op = self.local_op(entity_type.clone(), entity_id, OpType::Delete, Value::Null);

        let now = op.local_created_at;
        if let Some(record) = self
            .collections
            .get_mut(&entity_type)
            .and_then(|c| c.get_mut(entity_id))
        {
            record.mark_deleted(now, &op.hlc, Origin::Local);
        }
        Ok(self.commit(op))
    }

    /// Record that an entity was archived now.
    pub fn capture_archive(&mut self, entity_type: EntityType, entity_id: &str) -> Result<Operation> {
        self.archive_change(entity_type, entity_id, true)
    }

    /// Record that an entity was taken out of the archive.
    pub fn capture_unarchive(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Operation> {
        self.archive_change(entity_type, entity_id, false)
    }

    /// Record that a transaction was paid, at `paid_at` or now.
    pub fn capture_mark_paid(
        &mut self,
        transaction_id: &str,
        paid_at: Option<&str>,
    ) -> Result<Operation> {
        let entity_type = EntityType::Transaction;
        self.live_record(&entity_type, transaction_id)?;

        let paid_at = match paid_at {
            Some(value) => Value::from(value),
            None => Value::from(iso_timestamp(self.now())),
        };
        entity_type.validate_field(MoneyField::PaidAt.name(), &paid_at)?;

        let op = self.local_op(entity_type, transaction_id, OpType::MarkPaid, paid_at.clone());
        let op = self.capture_money(
            op,
            &[
                (MoneyField::Status, Value::from("paid")),
                (MoneyField::PaidAt, paid_at),
            ],
        );
        Ok(self.commit(op))
    }

    fn archive_change(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        archive: bool,
    ) -> Result<Operation> {
        self.live_record(&entity_type, entity_id)?;
        if !entity_type.is_archivable() {
            return Err(Error::UnsupportedOperation(format!(
                "{entity_type} cannot be archived"
            )));
        }

        let (op_type, value) = if archive {
            (OpType::Archive, Value::from(iso_timestamp(self.now())))
        } else {
            (OpType::Unarchive, Value::Null)
        };
        let op = self.local_op(entity_type, entity_id, op_type, value.clone());
        self.write_field(&op, ARCHIVED_AT, value, Origin::Local);
        Ok(self.commit(op))
    }

    /// Apply money field changes to the visible state and stamp the op
    /// with the money state before and after.
    fn capture_money(&mut self, op: Operation, changes: &[(MoneyField, Value)]) -> Operation {
        let before = self.money_snapshot(&op.entity_type, &op.entity_id);
        let after = changes
            .iter()
            .fold(before.clone(), |snapshot, (field, value)| {
                snapshot.with(*field, value)
            });
        let op = op.with_money(before, after.clone());
        self.write_money(&op, &after, Origin::Local);
        op
    }

    pub(crate) fn local_op(
        &mut self,
        entity_type: EntityType,
        entity_id: &str,
        op_type: OpType,
        value: Value,
    ) -> Operation {
        let hlc = self.clock.tick();
        let now = self.now();
        Operation::new(
            entity_type,
            entity_id,
            op_type,
            value,
            hlc,
            self.device.id.clone(),
            now,
        )
    }

    pub(crate) fn commit(&mut self, op: Operation) -> Operation {
        debug!(
            op_id = %op.id,
            entity = %op.entity_type,
            entity_id = %op.entity_id,
            op_type = %op.op_type,
            "captured operation"
        );
        self.log.append(op.clone());
        op
    }
}
