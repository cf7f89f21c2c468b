//! Ingestion admission
//!
//! Converts a raw source row into a new case record. Rows whose business key
//! does not normalize, or whose order lines carry an unknown status, are
//! rejected and never stored. Every raw field is preserved verbatim.

use crate::db::{AuditEntry, AuditLevel, AuditLog, CaseStore};
use crate::error::{ConsolidationError, Result};
use crate::services::normalizer::{
    normalize_amount, normalize_amount_number, normalize_case_key, normalize_client_code,
    normalize_order_key, normalize_service_type,
};
use caseflow_common::db::{
    Invoice, NewCaseRecord, OrderLine, OrderStatus, RawSourceFields, RawValue, ServiceData,
};
use caseflow_common::time::{now, parse_source_timestamp};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Source column names accepted for each field, in lookup order
///
/// Spreadsheet exports use either the header name or the column letter.
const CASE_NUMBER_COLUMNS: &[&str] = &["numero", "numeroExpediente", "A"];
const CLIENT_COLUMNS: &[&str] = &["cliente", "B"];
const REGISTERED_AT_COLUMNS: &[&str] = &["fechaRegistro", "C"];
const SERVICE_TYPE_COLUMNS: &[&str] = &["tipoServicio", "AV"];
const LAST_UPDATED_COLUMNS: &[&str] = &["ultimaActualizacion"];

/// A purchase-order line as supplied by a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawOrderLine {
    pub order_number: String,
    #[serde(default)]
    pub date: Option<RawValue>,
    #[serde(default)]
    pub price: Option<RawValue>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub invoice_reference: Option<String>,
}

/// An invoice as supplied by a source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawInvoice {
    pub invoice_number: String,
    #[serde(default)]
    pub date: Option<RawValue>,
    #[serde(default)]
    pub amount: Option<RawValue>,
}

/// One row from an ingestion source
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestRow {
    pub fields: RawSourceFields,
    #[serde(default)]
    pub order_lines: Vec<RawOrderLine>,
    #[serde(default)]
    pub invoices: Vec<RawInvoice>,
}

fn first_text(fields: &RawSourceFields, columns: &[&str]) -> Option<String> {
    columns
        .iter()
        .filter_map(|column| fields.get(column))
        .find_map(|value| value.as_text().filter(|text| !text.trim().is_empty()))
}

fn first_timestamp(fields: &RawSourceFields, columns: &[&str]) -> Option<DateTime<Utc>> {
    columns
        .iter()
        .filter_map(|column| fields.get(column))
        .find_map(raw_timestamp)
}

fn raw_timestamp(value: &RawValue) -> Option<DateTime<Utc>> {
    match value {
        RawValue::Date(ts) => Some(*ts),
        RawValue::Text(text) => parse_source_timestamp(text),
        _ => None,
    }
}

fn raw_amount(value: &RawValue) -> Option<Decimal> {
    match value {
        RawValue::Number(n) => Some(normalize_amount_number(*n)),
        RawValue::Text(text) if !text.trim().is_empty() => Some(normalize_amount(text)),
        _ => None,
    }
}

fn raw_to_json(value: &RawValue) -> serde_json::Value {
    match value {
        RawValue::Null => serde_json::Value::Null,
        RawValue::Bool(b) => serde_json::Value::Bool(*b),
        RawValue::Number(n) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        RawValue::Text(s) => serde_json::Value::String(s.clone()),
        RawValue::Date(d) => serde_json::Value::String(caseflow_common::time::to_storage(d)),
    }
}

fn admit_order_line(line: &RawOrderLine) -> Result<OrderLine> {
    let order_number = normalize_order_key(&line.order_number);
    if order_number.is_empty() {
        return Err(ConsolidationError::Ingest(format!(
            "order line '{}' has no valid order number",
            line.order_number
        )));
    }

    let status = match line.status.as_deref().map(str::trim) {
        None | Some("") => OrderStatus::NotInvoiced,
        Some(raw) => OrderStatus::parse_source(raw).ok_or_else(|| {
            ConsolidationError::Ingest(format!("order {} has unknown status '{}'", order_number, raw))
        })?,
    };

    Ok(OrderLine {
        order_number,
        date: line.date.as_ref().and_then(raw_timestamp),
        price: line.price.as_ref().and_then(raw_amount),
        status,
        invoice_reference: line
            .invoice_reference
            .as_ref()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty()),
    })
}

fn admit_invoice(invoice: &RawInvoice) -> Invoice {
    Invoice {
        invoice_number: invoice.invoice_number.trim().to_string(),
        date: invoice.date.as_ref().and_then(raw_timestamp),
        amount: invoice.amount.as_ref().and_then(raw_amount),
    }
}

/// Turn a raw row into a record ready for insertion
///
/// `default_client` is used when the row names no client.
pub fn admit(row: &IngestRow, source: Option<&str>, default_client: &str) -> Result<NewCaseRecord> {
    let raw_case_number = first_text(&row.fields, CASE_NUMBER_COLUMNS).unwrap_or_default();
    let raw_client_code =
        first_text(&row.fields, CLIENT_COLUMNS).unwrap_or_else(|| default_client.to_string());

    let case_number = normalize_case_key(&raw_case_number);
    let client_code = normalize_client_code(&raw_client_code);
    if case_number.is_empty() || client_code.is_empty() {
        return Err(ConsolidationError::InvalidKey {
            raw_case_number,
            raw_client_code,
        });
    }

    let order_lines = row
        .order_lines
        .iter()
        .map(admit_order_line)
        .collect::<Result<Vec<_>>>()?;
    let invoices = row.invoices.iter().map(admit_invoice).collect();

    let attributes = row
        .fields
        .iter()
        .map(|field| (field.name.clone(), raw_to_json(&field.value)))
        .collect();

    Ok(NewCaseRecord {
        case_number,
        client_code,
        source: source.map(str::to_string),
        service_data: ServiceData {
            service_type: normalize_service_type(first_text(&row.fields, SERVICE_TYPE_COLUMNS).as_deref()),
            service_date: first_timestamp(&row.fields, REGISTERED_AT_COLUMNS),
            attributes,
        },
        order_lines,
        invoices,
        last_updated: Some(first_timestamp(&row.fields, LAST_UPDATED_COLUMNS).unwrap_or_else(now)),
        raw_source_fields: row.fields.clone(),
    })
}

/// Counts from one ingestion batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows: usize,
    pub admitted: usize,
    pub rejected: usize,
    pub invalid_keys: usize,
    /// One message per rejected row, with its position in the batch
    pub errors: Vec<String>,
}

/// Admits rows and inserts them into the store
#[derive(Debug, Clone)]
pub struct IngestAdmission {
    store: CaseStore,
    audit: AuditLog,
    default_client: String,
}

impl IngestAdmission {
    pub fn new(store: CaseStore, audit: AuditLog, default_client: &str) -> Self {
        Self {
            store,
            audit,
            default_client: normalize_client_code(default_client),
        }
    }

    /// Admit and store one row, returning the new record id
    pub async fn ingest(&self, row: &IngestRow, source: Option<&str>) -> Result<i64> {
        let record = admit(row, source, &self.default_client)?;
        match self.store.insert(&record).await {
            Ok(id) => Ok(id),
            Err(e) if e.is_store_failure() => Err(ConsolidationError::StoreUnavailable(e)),
            Err(e) => Err(ConsolidationError::Ingest(format!(
                "case {} for client {} was refused by the store: {}",
                record.case_number, record.client_code, e
            ))),
        }
    }

    /// Admit and store a batch; rejected rows are counted, store errors abort
    pub async fn ingest_batch(&self, rows: &[IngestRow], source: Option<&str>) -> Result<IngestReport> {
        let mut report = IngestReport {
            rows: rows.len(),
            ..IngestReport::default()
        };

        for (index, row) in rows.iter().enumerate() {
            match self.ingest(row, source).await {
                Ok(id) => {
                    report.admitted += 1;
                    tracing::debug!(row = index, id, "Admitted row");
                }
                Err(e) if e.is_counted() => {
                    tracing::warn!(row = index, error = %e, "Rejected row");
                    report.rejected += 1;
                    if matches!(e, ConsolidationError::InvalidKey { .. }) {
                        report.invalid_keys += 1;
                    }
                    report.errors.push(format!("row {}: {}", index, e));
                }
                Err(e) => return Err(e),
            }
        }

        let level = if report.rejected > 0 {
            AuditLevel::Warning
        } else {
            AuditLevel::Info
        };
        self.audit
            .append(
                AuditEntry::new(
                    "ingest",
                    source.unwrap_or("unknown"),
                    serde_json::json!({
                        "rows": report.rows,
                        "admitted": report.admitted,
                        "rejected": report.rejected,
                        "invalid_keys": report.invalid_keys,
                    }),
                )
                .with_level(level),
            )
            .await;

        tracing::info!(
            rows = report.rows,
            admitted = report.admitted,
            rejected = report.rejected,
            "Ingestion batch complete"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: Vec<(&str, RawValue)>) -> IngestRow {
        IngestRow {
            fields: RawSourceFields::from_pairs(pairs),
            ..IngestRow::default()
        }
    }

    fn text(s: &str) -> RawValue {
        RawValue::Text(s.to_string())
    }

    #[test]
    fn test_admit_normalizes_key() {
        let record = admit(&row(vec![("numero", text("EXP-123")), ("cliente", text(" ike"))]), None, "IKE").unwrap();
        assert_eq!(record.case_number, "00000123");
        assert_eq!(record.client_code, "IKE");
    }

    #[test]
    fn test_admit_rejects_empty_key() {
        let err = admit(&row(vec![("numero", text("")), ("cliente", text("IKE"))]), None, "IKE").unwrap_err();
        assert!(matches!(err, ConsolidationError::InvalidKey { .. }));

        let err = admit(&row(vec![("cliente", text("IKE"))]), None, "IKE").unwrap_err();
        assert!(matches!(err, ConsolidationError::InvalidKey { .. }));
    }

    #[test]
    fn test_admit_column_letter_aliases_and_default_client() {
        let record = admit(&row(vec![("A", RawValue::Number(4567.0))]), Some("concentrado"), "axa").unwrap();
        assert_eq!(record.case_number, "00004567");
        assert_eq!(record.client_code, "AXA");
        assert_eq!(record.source.as_deref(), Some("concentrado"));
    }

    #[test]
    fn test_admit_preserves_raw_fields_verbatim() {
        let input = row(vec![
            ("numero", text("123")),
            ("cliente", text("IKE")),
            ("costoTotal", text("$1,500.00")),
            ("observaciones", RawValue::Null),
        ]);
        let record = admit(&input, None, "IKE").unwrap();
        assert_eq!(record.raw_source_fields, input.fields);
        assert_eq!(record.service_data.attributes.get("costoTotal"), Some(&serde_json::json!("$1,500.00")));
    }

    #[test]
    fn test_admit_parses_order_lines() {
        let mut input = row(vec![("numero", text("123")), ("cliente", text("IKE"))]);
        input.order_lines = vec![RawOrderLine {
            order_number: "PO 991".to_string(),
            date: Some(text("2024-02-01")),
            price: Some(text("1.500,00")),
            status: Some("Facturado".to_string()),
            invoice_reference: Some(" F-10 ".to_string()),
        }];
        input.invoices = vec![RawInvoice {
            invoice_number: "F-10".to_string(),
            date: None,
            amount: Some(RawValue::Number(1500.0)),
        }];

        let record = admit(&input, None, "IKE").unwrap();
        let line = &record.order_lines[0];
        assert_eq!(line.order_number, "0000000991");
        assert_eq!(line.status, OrderStatus::Invoiced);
        assert_eq!(line.price, Some(Decimal::new(150000, 2)));
        assert_eq!(line.invoice_reference.as_deref(), Some("F-10"));
        assert!(line.date.is_some());
        assert_eq!(record.invoices[0].amount, Some(Decimal::new(1500, 0)));
    }

    #[test]
    fn test_admit_rejects_unknown_status() {
        let mut input = row(vec![("numero", text("123")), ("cliente", text("IKE"))]);
        input.order_lines = vec![RawOrderLine {
            order_number: "1".to_string(),
            status: Some("cancelado".to_string()),
            ..RawOrderLine::default()
        }];

        let err = admit(&input, None, "IKE").unwrap_err();
        assert!(matches!(err, ConsolidationError::Ingest(_)));
    }

    #[test]
    fn test_admit_missing_status_defaults_to_not_invoiced() {
        let mut input = row(vec![("numero", text("123")), ("cliente", text("IKE"))]);
        input.order_lines = vec![RawOrderLine {
            order_number: "1".to_string(),
            ..RawOrderLine::default()
        }];

        let record = admit(&input, None, "IKE").unwrap();
        assert_eq!(record.order_lines[0].status, OrderStatus::NotInvoiced);
    }

    #[test]
    fn test_admit_service_type_and_dates() {
        let record = admit(
            &row(vec![
                ("numero", text("123")),
                ("cliente", text("IKE")),
                ("fechaRegistro", text("15/03/2024")),
                ("tipoServicio", text("Arrastre local")),
                ("ultimaActualizacion", text("2024-03-16")),
            ]),
            None,
            "IKE",
        )
        .unwrap();

        assert_eq!(record.service_data.service_type.as_deref(), Some("ARRASTRE"));
        assert_eq!(record.service_data.service_date, parse_source_timestamp("2024-03-15"));
        assert_eq!(record.last_updated, parse_source_timestamp("2024-03-16"));
    }
}
