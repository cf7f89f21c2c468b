//! Case record model types

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a business case: fixed-width case number plus client code
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BusinessKey {
    pub case_number: String,
    pub client_code: String,
}

impl BusinessKey {
    pub fn new(case_number: impl Into<String>, client_code: impl Into<String>) -> Self {
        Self {
            case_number: case_number.into(),
            client_code: client_code.into(),
        }
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.case_number, self.client_code)
    }
}

/// Billing status of a single purchase-order line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    #[default]
    NotInvoiced,
    Invoiced,
    InvoicedByCase,
}

impl OrderStatus {
    pub fn is_invoiced(&self) -> bool {
        matches!(self, OrderStatus::Invoiced | OrderStatus::InvoicedByCase)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::NotInvoiced => "NOT_INVOICED",
            OrderStatus::Invoiced => "INVOICED",
            OrderStatus::InvoicedByCase => "INVOICED_BY_CASE",
        }
    }

    /// Parse a free-text status as written by an ingestion source
    ///
    /// Accepts the canonical names and the spreadsheet vocabulary
    /// (`NO FACTURADO`, `FACTURADO`, `FACTURADO POR EXPEDIENTE`), ignoring
    /// case and `_`/`-`/space differences.
    /// Returns `None` for anything else.
    pub fn parse_source(raw: &str) -> Option<Self> {
        let folded: String = raw
            .trim()
            .to_uppercase()
            .replace(['_', '-'], " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");

        match folded.as_str() {
            "NOT INVOICED" | "NO FACTURADO" | "PENDIENTE" => Some(OrderStatus::NotInvoiced),
            "INVOICED" | "FACTURADO" => Some(OrderStatus::Invoiced),
            "INVOICED BY CASE" | "FACTURADO POR EXPEDIENTE" => Some(OrderStatus::InvoicedByCase),
            _ => None,
        }
    }
}

/// One purchase-order line attached to a case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub order_number: String,
    pub date: Option<DateTime<Utc>>,
    pub price: Option<Decimal>,
    #[serde(default)]
    pub status: OrderStatus,
    pub invoice_reference: Option<String>,
}

/// One invoice attached to a case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_number: String,
    pub date: Option<DateTime<Utc>>,
    pub amount: Option<Decimal>,
}

/// Why a record was classified as a duplicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DuplicateReason {
    /// An older submission of a case that has a more recent record
    PriorVersion,
}

impl DuplicateReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DuplicateReason::PriorVersion => "PRIOR_VERSION",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PRIOR_VERSION" => Some(DuplicateReason::PriorVersion),
            _ => None,
        }
    }
}

/// Derived billing status of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionState {
    #[default]
    Pending,
    Partial,
    Complete,
}

impl CompletionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionState::Pending => "PENDING",
            CompletionState::Partial => "PARTIAL",
            CompletionState::Complete => "COMPLETE",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(CompletionState::Pending),
            "PARTIAL" => Some(CompletionState::Partial),
            "COMPLETE" => Some(CompletionState::Complete),
            _ => None,
        }
    }
}

/// Classification of a record derived from its canonical/duplicate flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    /// Never reconciled: neither flag set
    Unclassified,
    Canonical,
    Duplicate,
}

impl Classification {
    /// Canonical takes precedence when both flags are set on legacy rows
    pub fn from_flags(is_canonical: Option<bool>, is_duplicate: Option<bool>) -> Self {
        if is_canonical == Some(true) {
            Classification::Canonical
        } else if is_duplicate == Some(true) {
            Classification::Duplicate
        } else {
            Classification::Unclassified
        }
    }
}

/// Reconciliation fields; written only by the consolidation engine
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReconciliationState {
    pub last_updated: Option<DateTime<Utc>>,
    pub is_canonical: Option<bool>,
    pub is_duplicate: Option<bool>,
    pub duplicate_reason: Option<DuplicateReason>,
    pub canonical_reference: Option<BusinessKey>,
    pub invoiced: bool,
    pub completion_state: CompletionState,
    pub last_consolidation_run: Option<DateTime<Utc>>,
}

impl ReconciliationState {
    pub fn classification(&self) -> Classification {
        Classification::from_flags(self.is_canonical, self.is_duplicate)
    }
}

/// Scalar value of a raw source field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum RawValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    Date(DateTime<Utc>),
}

impl RawValue {
    /// Text form used when a raw value feeds a normalizer
    pub fn as_text(&self) -> Option<String> {
        match self {
            RawValue::Null => None,
            RawValue::Bool(b) => Some(b.to_string()),
            RawValue::Number(n) => Some(n.to_string()),
            RawValue::Text(s) => Some(s.clone()),
            RawValue::Date(d) => Some(crate::time::to_storage(d)),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

/// One named raw source field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawField {
    pub name: String,
    pub value: RawValue,
}

/// Every field an ingestion source supplied, in source order
///
/// Built once at ingestion and never modified afterwards; the type exposes no
/// mutating methods.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawSourceFields(Vec<RawField>);

impl RawSourceFields {
    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, RawValue)>,
        K: Into<String>,
    {
        Self(
            pairs
                .into_iter()
                .map(|(name, value)| RawField {
                    name: name.into(),
                    value,
                })
                .collect(),
        )
    }

    /// First field with the given name
    pub fn get(&self, name: &str) -> Option<&RawValue> {
        self.0.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// True when the field is present with a non-null value
    pub fn has_value(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_null())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawField> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Job attributes; only `service_type` and `service_date` are mirrored into
/// their own columns
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServiceData {
    pub service_type: Option<String>,
    pub service_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

/// A persisted case record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub id: i64,
    pub key: BusinessKey,
    pub source: Option<String>,
    pub service_data: ServiceData,
    pub order_lines: Vec<OrderLine>,
    pub invoices: Vec<Invoice>,
    pub reconciliation: ReconciliationState,
    pub raw_source_fields: RawSourceFields,
}

/// A case record about to be inserted by an ingestion source
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NewCaseRecord {
    pub case_number: String,
    pub client_code: String,
    pub source: Option<String>,
    pub service_data: ServiceData,
    pub order_lines: Vec<OrderLine>,
    pub invoices: Vec<Invoice>,
    pub last_updated: Option<DateTime<Utc>>,
    pub raw_source_fields: RawSourceFields,
}

/// A client whose cases are tracked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub code: String,
    pub name: String,
    pub active: bool,
}
