//! Money state of transactions and its version chain.
//!
//! Money fields are never merged blindly. Every change to a transaction's
//! money state is recorded as a [`MoneyEventVersion`], and exactly one
//! version per transaction is active: the one that matches what is shown.

use crate::{entity::MoneyField, error::Result, EntityId, Error, Hlc, NodeId, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The money fields of a transaction at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneySnapshot {
    pub amount_minor: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub paid_at: Option<String>,
}

impl MoneySnapshot {
    /// Read the money fields out of a record payload.
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let mut snapshot = Self::default();
        for field in MoneyField::ALL {
            if let Some(value) = payload.get(field.name()) {
                snapshot.set(field, value);
            }
        }
        snapshot
    }

    /// Parse a snapshot from its JSON form, rejecting anything else.
    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidPayload(format!("not a money snapshot: {e}")))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn get(&self, field: MoneyField) -> Value {
        match field {
            MoneyField::AmountMinor => self.amount_minor.map(Value::from),
            MoneyField::Currency => self.currency.clone().map(Value::from),
            MoneyField::Status => self.status.clone().map(Value::from),
            MoneyField::PaidAt => self.paid_at.clone().map(Value::from),
        }
        .unwrap_or(Value::Null)
    }

    /// Set one field. Values of the wrong JSON type clear the field.
    pub fn set(&mut self, field: MoneyField, value: &Value) {
        match field {
            MoneyField::AmountMinor => self.amount_minor = value.as_i64(),
            MoneyField::Currency => self.currency = value.as_str().map(str::to_string),
            MoneyField::Status => self.status = value.as_str().map(str::to_string),
            MoneyField::PaidAt => self.paid_at = value.as_str().map(str::to_string),
        }
    }

    /// A copy with one field replaced.
    pub fn with(&self, field: MoneyField, value: &Value) -> Self {
        let mut next = self.clone();
        next.set(field, value);
        next
    }

    /// Write the snapshot into a record payload. Empty fields are removed.
    pub fn write_to(&self, payload: &mut Map<String, Value>) {
        for field in MoneyField::ALL {
            match self.get(field) {
                Value::Null => {
                    payload.remove(field.name());
                }
                value => {
                    payload.insert(field.name().to_string(), value);
                }
            }
        }
    }

    /// Fields whose values differ between two snapshots.
    pub fn changed_fields(&self, other: &MoneySnapshot) -> Vec<MoneyField> {
        MoneyField::ALL
            .into_iter()
            .filter(|f| self.get(*f) != other.get(*f))
            .collect()
    }
}

/// One recorded money state of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoneyEventVersion {
    pub transaction_id: EntityId,
    /// 1-based position in the chain
    pub version: u32,
    pub snapshot: MoneySnapshot,
    pub hlc: Hlc,
    pub device_id: NodeId,
    pub op_id: OperationId,
    /// Whether this version is the visible money state
    pub active: bool,
}

/// The ordered version chain of one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MoneyChain {
    versions: Vec<MoneyEventVersion>,
}

impl MoneyChain {
    pub fn versions(&self) -> &[MoneyEventVersion] {
        &self.versions
    }

    pub fn active(&self) -> Option<&MoneyEventVersion> {
        self.versions.iter().find(|v| v.active)
    }

    /// Whether the device already recorded a money change newer than `hlc`.
    pub fn has_newer_from(&self, device_id: &str, hlc: &Hlc) -> bool {
        self.versions
            .iter()
            .any(|v| v.device_id == device_id && v.hlc > *hlc)
    }

    /// Append a version. An active version deactivates all others.
    pub fn push(
        &mut self,
        transaction_id: &str,
        snapshot: MoneySnapshot,
        hlc: Hlc,
        device_id: &str,
        op_id: &str,
        active: bool,
    ) -> u32 {
        if active {
            for v in &mut self.versions {
                v.active = false;
            }
        }
        let version = self.versions.len() as u32 + 1;
        self.versions.push(MoneyEventVersion {
            transaction_id: transaction_id.to_string(),
            version,
            snapshot,
            hlc,
            device_id: device_id.to_string(),
            op_id: op_id.to_string(),
            active,
        });
        version
    }
}
