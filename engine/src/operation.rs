//! Operation types for expressing changes.
//!
//! Every change to a synced entity is recorded as an immutable operation.
//! Updates are per field, so two devices editing different fields of the
//! same record never collide.

use crate::{money::MoneySnapshot, EntityId, EntityType, Hlc, NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Unique identifier for an operation: `"<hlc>@<device id>"`.
pub type OperationId = String;

/// The kind of change an operation records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OpType {
    Create,
    Update,
    Delete,
    Archive,
    Unarchive,
    MarkPaid,
    ResolveConflict,
    /// An operation type this build does not know
    Unknown(String),
}

impl OpType {
    pub fn as_str(&self) -> &str {
        match self {
            OpType::Create => "create",
            OpType::Update => "update",
            OpType::Delete => "delete",
            OpType::Archive => "archive",
            OpType::Unarchive => "unarchive",
            OpType::MarkPaid => "markPaid",
            OpType::ResolveConflict => "resolveConflict",
            OpType::Unknown(name) => name,
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for OpType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "create" => OpType::Create,
            "update" => OpType::Update,
            "delete" => OpType::Delete,
            "archive" => OpType::Archive,
            "unarchive" => OpType::Unarchive,
            "markPaid" => OpType::MarkPaid,
            "resolveConflict" => OpType::ResolveConflict,
            _ => OpType::Unknown(value),
        }
    }
}

impl From<OpType> for String {
    fn from(value: OpType) -> Self {
        value.as_str().to_string()
    }
}

/// The sender's money state around a money-changing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyChange {
    pub before: MoneySnapshot,
    pub after: MoneySnapshot,
}

/// A single recorded change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// `"<hlc>@<device id>"`
    pub id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub op_type: OpType,
    /// Target field for `update` and field-level `resolveConflict`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// New value: the field value, the create payload, or the resolved value
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<Value>,
    pub hlc: Hlc,
    pub device_id: NodeId,
    /// Wall time on the originating device (milliseconds since epoch)
    pub local_created_at: Timestamp,
    /// Present on every operation that changes a transaction's money fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub money_version: Option<MoneyChange>,
}

impl Operation {
    /// Build an operation, deriving its id from the clock value and device.
    pub fn new(
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        op_type: OpType,
        value: Value,
        hlc: Hlc,
        device_id: impl Into<NodeId>,
        local_created_at: Timestamp,
    ) -> Self {
        let device_id = device_id.into();
        Self {
            id: Self::derive_id(&hlc, &device_id),
            entity_type,
            entity_id: entity_id.into(),
            op_type,
            field: None,
            value,
            previous_value: None,
            hlc,
            device_id,
            local_created_at,
            money_version: None,
        }
    }

    /// The id an operation with this clock value and device must carry.
    pub fn derive_id(hlc: &Hlc, device_id: &str) -> OperationId {
        format!("{hlc}@{device_id}")
    }

    /// Set the target field.
    pub fn with_field(mut self, field: impl Into<String>, previous_value: Value) -> Self {
        self.field = Some(field.into());
        self.previous_value = Some(previous_value);
        self
    }

    /// Attach the money state around this change.
    pub fn with_money(mut self, before: MoneySnapshot, after: MoneySnapshot) -> Self {
        self.money_version = Some(MoneyChange { before, after });
        self
    }

    /// Whether the id matches the clock value and device.
    pub fn has_derived_id(&self) -> bool {
        self.id == Self::derive_id(&self.hlc, &self.device_id)
    }
}

/// Operations are ordered by clock value, then by id.
impl Ord for Operation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.hlc.cmp(&other.hlc).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Operation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Eq for Operation {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn update(counter: u32, device: &str) -> Operation {
        Operation::new(
            EntityType::Client,
            "client-1",
            OpType::Update,
            json!("Acme"),
            Hlc::new(1000, counter, device),
            device,
            1000,
        )
        .with_field("name", json!("ACME"))
    }

    #[test]
    fn id_is_derived_from_hlc_and_device() {
        let op = update(3, "dev-a");
        assert_eq!(op.id, format!("{}@dev-a", Hlc::new(1000, 3, "dev-a")));
        assert!(op.has_derived_id());

        let mut forged = op.clone();
        forged.device_id = "dev-b".into();
        assert!(!forged.has_derived_id());
    }

    #[test]
    fn operation_ordering() {
        let op1 = update(1, "dev-b");
        let op2 = update(2, "dev-a");
        assert!(op1 < op2);

        let mut ops = vec![op2.clone(), op1.clone()];
        ops.sort();
        assert_eq!(ops, vec![op1, op2]);
    }

    #[test]
    fn op_type_names() {
        assert_eq!(
            serde_json::to_string(&OpType::MarkPaid).unwrap(),
            "\"markPaid\""
        );
        let parsed: OpType = serde_json::from_str("\"merge\"").unwrap();
        assert_eq!(parsed, OpType::Unknown("merge".into()));
    }

    #[test]
    fn serialization_format() {
        let op = update(1, "dev-a");
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["entityType"], "client");
        assert_eq!(json["opType"], "update");
        assert_eq!(json["field"], "name");
        assert_eq!(json["previousValue"], "ACME");
        assert!(json.get("moneyVersion").is_none());

        let parsed: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, op);
    }

    #[test]
    fn money_change_is_serialized() {
        let before = MoneySnapshot::default();
        let after = MoneySnapshot {
            amount_minor: Some(100),
            ..Default::default()
        };
        let op = update(1, "dev-a").with_money(before, after);
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["moneyVersion"]["after"]["amountMinor"], 100);
    }
}
