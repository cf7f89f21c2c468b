//! Raw field integrity check
//!
//! Verifies that stored records still carry the raw source fields every
//! import is expected to preserve.

use crate::db::{CaseFilter, CaseSort, CaseStore};
use crate::error::Result;
use crate::services::normalizer::normalize_client_code;
use caseflow_common::db::CaseRecord;
use serde::Serialize;
use std::collections::BTreeMap;

/// Integrity of one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordIntegrity {
    pub record_id: i64,
    pub case_number: String,
    pub missing_fields: Vec<String>,
    pub raw_field_count: usize,
    pub has_orders: bool,
    pub has_invoices: bool,
    pub invoiced: bool,
}

impl RecordIntegrity {
    pub fn is_complete(&self) -> bool {
        self.missing_fields.is_empty()
    }
}

/// Check one record against the required field list
pub fn check_record(record: &CaseRecord, required_fields: &[String]) -> RecordIntegrity {
    RecordIntegrity {
        record_id: record.id,
        case_number: record.key.case_number.clone(),
        missing_fields: required_fields
            .iter()
            .filter(|name| !record.raw_source_fields.has_value(name))
            .cloned()
            .collect(),
        raw_field_count: record.raw_source_fields.len(),
        has_orders: !record.order_lines.is_empty(),
        has_invoices: !record.invoices.is_empty(),
        invoiced: record.reconciliation.invoiced,
    }
}

/// Integrity summary for one client
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub client_code: String,
    pub total_records: usize,
    pub complete_records: usize,
    pub with_orders: usize,
    pub with_invoices: usize,
    pub invoiced: usize,
    /// Required field name to number of records missing it
    pub missing_by_field: BTreeMap<String, usize>,
    /// Records missing at least one required field
    pub incomplete: Vec<RecordIntegrity>,
}

/// Scan every record of a client
pub async fn scan_client(
    store: &CaseStore,
    client_code: &str,
    required_fields: &[String],
) -> Result<IntegrityReport> {
    let client_code = normalize_client_code(client_code);
    let records = store
        .find(&CaseFilter::for_client(&client_code), CaseSort::IdAsc, 0, None)
        .await?;

    let mut report = IntegrityReport {
        client_code,
        total_records: records.len(),
        ..IntegrityReport::default()
    };

    for record in &records {
        let integrity = check_record(record, required_fields);
        report.with_orders += usize::from(integrity.has_orders);
        report.with_invoices += usize::from(integrity.has_invoices);
        report.invoiced += usize::from(integrity.invoiced);

        if integrity.is_complete() {
            report.complete_records += 1;
        } else {
            for name in &integrity.missing_fields {
                *report.missing_by_field.entry(name.clone()).or_default() += 1;
            }
            report.incomplete.push(integrity);
        }
    }

    if report.incomplete.is_empty() {
        tracing::info!(client_code = %report.client_code, records = report.total_records, "All records complete");
    } else {
        tracing::warn!(
            client_code = %report.client_code,
            records = report.total_records,
            incomplete = report.incomplete.len(),
            "Records missing required raw fields"
        );
    }

    Ok(report)
}
