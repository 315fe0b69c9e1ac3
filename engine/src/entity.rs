//! Entity types and their field tables.
//!
//! Every synced entity has a fixed, reviewed table of fields. The table
//! decides how a field is validated and how it merges: system fields are
//! never captured, money fields on transactions are versioned instead of
//! merged with last-writer-wins.

use crate::{error::Result, Error};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// The kinds of business records that are synced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Client,
    Project,
    Transaction,
    Category,
    FxRate,
    Document,
    BusinessProfile,
    /// A type this build does not know. Kept so the operation can be
    /// reported instead of failing a whole batch.
    Unknown(String),
}

impl EntityType {
    /// All known entity types.
    pub fn all() -> [EntityType; 7] {
        [
            EntityType::Client,
            EntityType::Project,
            EntityType::Transaction,
            EntityType::Category,
            EntityType::FxRate,
            EntityType::Document,
            EntityType::BusinessProfile,
        ]
    }

    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Client => "client",
            EntityType::Project => "project",
            EntityType::Transaction => "transaction",
            EntityType::Category => "category",
            EntityType::FxRate => "fxRate",
            EntityType::Document => "document",
            EntityType::BusinessProfile => "businessProfile",
            EntityType::Unknown(name) => name,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EntityType::Unknown(_))
    }

    /// The field table for this entity type. Empty for unknown types.
    pub fn fields(&self) -> &'static [FieldDef] {
        match self {
            EntityType::Client => CLIENT_FIELDS,
            EntityType::Project => PROJECT_FIELDS,
            EntityType::Transaction => TRANSACTION_FIELDS,
            EntityType::Category => CATEGORY_FIELDS,
            EntityType::FxRate => FX_RATE_FIELDS,
            EntityType::Document => DOCUMENT_FIELDS,
            EntityType::BusinessProfile => BUSINESS_PROFILE_FIELDS,
            EntityType::Unknown(_) => &[],
        }
    }

    /// Look up a field definition by name.
    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields().iter().find(|f| f.name == name)
    }

    /// Whether this entity carries versioned money fields.
    pub fn has_money_fields(&self) -> bool {
        self.fields().iter().any(|f| f.money_field().is_some())
    }

    /// Whether this entity can be archived.
    pub fn is_archivable(&self) -> bool {
        self.field(ARCHIVED_AT).is_some()
    }

    /// Fail with [`Error::UnknownEntityType`] unless the type is known.
    pub fn ensure_known(&self) -> Result<()> {
        if self.is_known() {
            Ok(())
        } else {
            Err(Error::UnknownEntityType(self.as_str().to_string()))
        }
    }

    /// Validate a single field change and return its definition.
    ///
    /// `null` clears an optional field.
    pub fn validate_field(&self, name: &str, value: &Value) -> Result<&'static FieldDef> {
        self.ensure_known()?;
        let def = self.field(name).ok_or_else(|| Error::UnknownField {
            entity_type: self.as_str().to_string(),
            field: name.to_string(),
        })?;
        if def.kind == FieldKind::System {
            return Err(Error::SystemField(name.to_string()));
        }
        def.validate(Some(value))?;
        Ok(def)
    }

    /// Validate a create payload and return it without system fields.
    pub fn validate_create(&self, payload: &Value) -> Result<Map<String, Value>> {
        self.ensure_known()?;
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for key in obj.keys() {
            if self.field(key).is_none() {
                return Err(Error::UnknownField {
                    entity_type: self.as_str().to_string(),
                    field: key.clone(),
                });
            }
        }

        let mut clean = Map::new();
        for def in self.fields() {
            if def.kind == FieldKind::System {
                continue;
            }
            let value = obj.get(def.name);
            def.validate(value)?;
            match value {
                Some(Value::Null) | None => {}
                Some(v) => {
                    clean.insert(def.name.to_string(), v.clone());
                }
            }
        }
        Ok(clean)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "client" => EntityType::Client,
            "project" => EntityType::Project,
            "transaction" => EntityType::Transaction,
            "category" => EntityType::Category,
            "fxRate" => EntityType::FxRate,
            "document" => EntityType::Document,
            "businessProfile" => EntityType::BusinessProfile,
            _ => EntityType::Unknown(value),
        }
    }
}

impl From<&str> for EntityType {
    fn from(value: &str) -> Self {
        EntityType::from(value.to_string())
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

impl std::str::FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let entity_type = EntityType::from(s);
        entity_type.ensure_known()?;
        Ok(entity_type)
    }
}

/// Field value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339 timestamp or `YYYY-MM-DD` date
    Timestamp,
    /// One of a fixed set of strings
    Enum(&'static [&'static str]),
    /// Arbitrary nested JSON
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Enum(values) => write!(f, "one of [{}]", values.join(", ")),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// The money fields of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MoneyField {
    AmountMinor,
    Currency,
    Status,
    PaidAt,
}

impl MoneyField {
    pub const ALL: [MoneyField; 4] = [
        MoneyField::AmountMinor,
        MoneyField::Currency,
        MoneyField::Status,
        MoneyField::PaidAt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MoneyField::AmountMinor => "amountMinor",
            MoneyField::Currency => "currency",
            MoneyField::Status => "status",
            MoneyField::PaidAt => "paidAt",
        }
    }
}

/// How a field takes part in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Identity or derived; never captured as a field change
    System,
    /// Merged with last-writer-wins
    Plain,
    /// Versioned; divergent edits become conflicts
    Money(MoneyField),
}

/// Definition of a field in an entity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    pub kind: FieldKind,
}

impl FieldDef {
    pub const fn required(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: true,
            kind: FieldKind::Plain,
        }
    }

    pub const fn optional(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            kind: FieldKind::Plain,
        }
    }

    pub const fn system(name: &'static str, field_type: FieldType) -> Self {
        Self {
            name,
            field_type,
            required: false,
            kind: FieldKind::System,
        }
    }

    const fn money(mut self, field: MoneyField) -> Self {
        self.kind = FieldKind::Money(field);
        self
    }

    pub fn money_field(&self) -> Option<MoneyField> {
        match self.kind {
            FieldKind::Money(field) => Some(field),
            _ => None,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.to_string()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.as_str().is_some_and(is_timestamp),
            FieldType::Enum(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
            FieldType::Json => true,
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.to_string(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn is_timestamp(s: &str) -> bool {
    chrono::DateTime::parse_from_rfc3339(s).is_ok()
        || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// Name of the archive marker field.
pub const ARCHIVED_AT: &str = "archivedAt";

const TX_KIND: &[&str] = &["income", "expense"];
const TX_STATUS: &[&str] = &["paid", "unpaid"];
const DOCUMENT_TYPE: &[&str] = &[
    "invoice",
    "receipt",
    "invoice_receipt",
    "credit_note",
    "price_offer",
    "proforma_invoice",
    "donation_receipt",
];
const DOCUMENT_STATUS: &[&str] = &["draft", "issued", "paid", "voided"];
const BUSINESS_TYPE: &[&str] = &["exempt", "authorized", "company", "lawyer", "none"];
const LANGUAGE: &[&str] = &["ar", "en"];

use FieldType::{Bool, Enum, Float, Int, Json, String as Str, Timestamp};

const ID: FieldDef = FieldDef::system("id", Str);
const CREATED_AT: FieldDef = FieldDef::system("createdAt", Timestamp);
const UPDATED_AT: FieldDef = FieldDef::system("updatedAt", Timestamp);

static CLIENT_FIELDS: &[FieldDef] = &[
    ID,
    CREATED_AT,
    UPDATED_AT,
    FieldDef::required("name", Str),
    FieldDef::optional("email", Str),
    FieldDef::optional("phone", Str),
    FieldDef::optional("notes", Str),
    FieldDef::optional(ARCHIVED_AT, Timestamp),
];

static PROJECT_FIELDS: &[FieldDef] = &[
    ID,
    CREATED_AT,
    UPDATED_AT,
    FieldDef::required("name", Str),
    FieldDef::optional("clientId", Str),
    FieldDef::optional("field", Str),
    FieldDef::optional("notes", Str),
    FieldDef::optional(ARCHIVED_AT, Timestamp),
];

static CATEGORY_FIELDS: &[FieldDef] = &[
    ID,
    FieldDef::required("kind", Enum(TX_KIND)),
    FieldDef::required("name", Str),
];

static TRANSACTION_FIELDS: &[FieldDef] = &[
    ID,
    CREATED_AT,
    UPDATED_AT,
    FieldDef::system("deletedAt", Timestamp),
    FieldDef::required("kind", Enum(TX_KIND)),
    FieldDef::required("status", Enum(TX_STATUS)).money(MoneyField::Status),
    FieldDef::optional("title", Str),
    FieldDef::optional("clientId", Str),
    FieldDef::optional("projectId", Str),
    FieldDef::optional("categoryId", Str),
    FieldDef::required("amountMinor", Int).money(MoneyField::AmountMinor),
    FieldDef::required("currency", Str).money(MoneyField::Currency),
    FieldDef::required("occurredAt", Timestamp),
    FieldDef::optional("dueDate", Timestamp),
    FieldDef::optional("paidAt", Timestamp).money(MoneyField::PaidAt),
    FieldDef::optional("notes", Str),
    FieldDef::optional("linkedDocumentId", Str),
    FieldDef::optional("linkedProjectedIncomeId", Str),
];

static FX_RATE_FIELDS: &[FieldDef] = &[
    ID,
    CREATED_AT,
    FieldDef::required("baseCurrency", Str),
    FieldDef::required("quoteCurrency", Str),
    FieldDef::required("rate", Float),
    FieldDef::required("effectiveDate", Timestamp),
    FieldDef::required("source", Str),
];

static DOCUMENT_FIELDS: &[FieldDef] = &[
    ID,
    CREATED_AT,
    UPDATED_AT,
    FieldDef::system("deletedAt", Timestamp),
    FieldDef::required("number", Str),
    FieldDef::required("type", Enum(DOCUMENT_TYPE)),
    FieldDef::required("status", Enum(DOCUMENT_STATUS)),
    FieldDef::required("businessProfileId", Str),
    FieldDef::optional("clientId", Str),
    FieldDef::optional("subject", Str),
    FieldDef::optional("brief", Str),
    FieldDef::optional("notes", Str),
    FieldDef::optional("items", Json),
    FieldDef::optional("payments", Json),
    FieldDef::optional("subtotalMinor", Int),
    FieldDef::optional("discountMinor", Int),
    FieldDef::optional("taxMinor", Int),
    FieldDef::optional("totalMinor", Int),
    FieldDef::optional("taxRate", Float),
    FieldDef::optional("vatEnabled", Bool),
    FieldDef::required("currency", Str),
    FieldDef::required("language", Enum(LANGUAGE)),
    FieldDef::optional("issueDate", Timestamp),
    FieldDef::optional("dueDate", Timestamp),
    FieldDef::optional("paidAt", Timestamp),
    FieldDef::optional("refDocumentId", Str),
    FieldDef::optional("linkedTransactionIds", Json),
    FieldDef::optional("templateId", Str),
];

static BUSINESS_PROFILE_FIELDS: &[FieldDef] = &[
    ID,
    CREATED_AT,
    UPDATED_AT,
    FieldDef::required("name", Str),
    FieldDef::optional("nameEn", Str),
    FieldDef::required("email", Str),
    FieldDef::optional("phone", Str),
    FieldDef::optional("taxId", Str),
    FieldDef::required("businessType", Enum(BUSINESS_TYPE)),
    FieldDef::optional("address1", Str),
    FieldDef::optional("city", Str),
    FieldDef::optional("country", Str),
    FieldDef::optional("postalCode", Str),
    FieldDef::optional("logoDataUrl", Str),
    FieldDef::optional("primaryColor", Str),
    FieldDef::required("defaultCurrency", Str),
    FieldDef::required("defaultLanguage", Enum(LANGUAGE)),
    FieldDef::required("isDefault", Bool),
    FieldDef::optional("website", Str),
    FieldDef::optional(ARCHIVED_AT, Timestamp),
];

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_names_roundtrip() {
        for entity_type in EntityType::all() {
            let json = serde_json::to_string(&entity_type).unwrap();
            let parsed: EntityType = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, entity_type);
            assert!(parsed.is_known());
        }
        assert_eq!(
            serde_json::to_string(&EntityType::FxRate).unwrap(),
            "\"fxRate\""
        );
    }

    #[test]
    fn unknown_entity_type_is_preserved() {
        let parsed: EntityType = serde_json::from_str("\"invoiceTemplate\"").unwrap();
        assert_eq!(parsed, EntityType::Unknown("invoiceTemplate".into()));
        assert_eq!(
            parsed.ensure_known(),
            Err(Error::UnknownEntityType("invoiceTemplate".into()))
        );
        assert!("invoiceTemplate".parse::<EntityType>().is_err());
    }

    #[test]
    fn money_fields_only_on_transactions() {
        let money: Vec<_> = EntityType::Transaction
            .fields()
            .iter()
            .filter_map(|f| f.money_field())
            .collect();
        assert_eq!(money.len(), MoneyField::ALL.len());

        for entity_type in EntityType::all() {
            if entity_type != EntityType::Transaction {
                assert!(!entity_type.has_money_fields(), "{entity_type}");
            }
        }
        // A document's paidAt is a plain field
        let doc_paid = EntityType::Document.field("paidAt").unwrap();
        assert_eq!(doc_paid.kind, FieldKind::Plain);
    }

    #[test]
    fn validate_field_rejects_system_and_unknown() {
        let client = EntityType::Client;
        assert_eq!(
            client.validate_field("createdAt", &json!("2024-01-01")),
            Err(Error::SystemField("createdAt".into()))
        );
        assert!(matches!(
            client.validate_field("nickname", &json!("x")),
            Err(Error::UnknownField { .. })
        ));
        assert!(client.validate_field("email", &Value::Null).is_ok());
        assert!(matches!(
            client.validate_field("name", &Value::Null),
            Err(Error::MissingRequiredField(_))
        ));
    }

    #[test]
    fn validate_types() {
        let tx = EntityType::Transaction;
        assert!(tx.validate_field("amountMinor", &json!(1500)).is_ok());
        assert!(matches!(
            tx.validate_field("amountMinor", &json!("1500")),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(matches!(
            tx.validate_field("amountMinor", &json!(15.5)),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(tx.validate_field("status", &json!("paid")).is_ok());
        assert!(tx.validate_field("status", &json!("maybe")).is_err());
        assert!(tx
            .validate_field("paidAt", &json!("2024-03-01T10:00:00.000Z"))
            .is_ok());
        assert!(tx.validate_field("dueDate", &json!("2024-03-01")).is_ok());
        assert!(tx.validate_field("dueDate", &json!("next week")).is_err());
    }

    #[test]
    fn validate_create_strips_system_fields() {
        let payload = json!({
            "id": "c-1",
            "name": "Acme",
            "email": null,
            "createdAt": "2024-01-01T00:00:00Z"
        });
        let clean = EntityType::Client.validate_create(&payload).unwrap();
        assert_eq!(clean.len(), 1);
        assert_eq!(clean["name"], "Acme");
    }

    #[test]
    fn validate_create_requires_fields() {
        let result = EntityType::Transaction.validate_create(&json!({
            "kind": "income",
            "status": "unpaid",
            "currency": "USD",
            "occurredAt": "2024-01-01"
        }));
        assert_eq!(
            result,
            Err(Error::MissingRequiredField("amountMinor".into()))
        );
        assert!(EntityType::Client.validate_create(&json!([1, 2])).is_err());
    }

    #[test]
    fn archivable_types() {
        assert!(EntityType::Client.is_archivable());
        assert!(EntityType::Project.is_archivable());
        assert!(EntityType::BusinessProfile.is_archivable());
        assert!(!EntityType::Transaction.is_archivable());
        assert!(!EntityType::Category.is_archivable());
    }
}
