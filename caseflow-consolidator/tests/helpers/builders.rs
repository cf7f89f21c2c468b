//! Record builders

use caseflow_common::db::{
    BusinessKey, CaseRecord, Invoice, NewCaseRecord, OrderLine, OrderStatus, RawSourceFields,
    RawValue, ReconciliationState, ServiceData,
};
use caseflow_consolidator::services::ProjectedRecord;
use caseflow_consolidator::AppState;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

pub fn ts(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub fn order_line(number: &str, price: &str, status: OrderStatus) -> OrderLine {
    OrderLine {
        order_number: number.to_string(),
        date: None,
        price: Some(dec(price)),
        status,
        invoice_reference: None,
    }
}

pub fn invoice(number: &str, amount: &str) -> Invoice {
    Invoice {
        invoice_number: number.to_string(),
        date: None,
        amount: Some(dec(amount)),
    }
}

/// Builder for records inserted straight into the store
pub struct RecordBuilder {
    record: NewCaseRecord,
}

impl RecordBuilder {
    pub fn new(case_number: &str, client_code: &str) -> Self {
        Self {
            record: NewCaseRecord {
                case_number: case_number.to_string(),
                client_code: client_code.to_string(),
                raw_source_fields: RawSourceFields::from_pairs([
                    ("numero", RawValue::Text(case_number.to_string())),
                    ("cliente", RawValue::Text(client_code.to_string())),
                ]),
                ..NewCaseRecord::default()
            },
        }
    }

    pub fn last_updated(mut self, at: DateTime<Utc>) -> Self {
        self.record.last_updated = Some(at);
        self
    }

    pub fn order_line(mut self, line: OrderLine) -> Self {
        self.record.order_lines.push(line);
        self
    }

    pub fn invoice(mut self, invoice: Invoice) -> Self {
        self.record.invoices.push(invoice);
        self
    }

    pub fn service_type(mut self, service_type: &str) -> Self {
        self.record.service_data.service_type = Some(service_type.to_string());
        self
    }

    pub fn raw_fields(mut self, fields: RawSourceFields) -> Self {
        self.record.raw_source_fields = fields;
        self
    }

    pub fn build(self) -> NewCaseRecord {
        self.record
    }

    pub async fn insert(self, state: &AppState) -> i64 {
        state.store.insert(&self.record).await.unwrap()
    }
}

/// Projected record for resolver tests that never touch the store
pub fn projected(id: i64, case_number: &str, client_code: &str, last_updated: Option<DateTime<Utc>>) -> ProjectedRecord {
    ProjectedRecord::from_record(CaseRecord {
        id,
        key: BusinessKey::new(case_number, client_code),
        source: None,
        service_data: ServiceData::default(),
        order_lines: Vec::new(),
        invoices: Vec::new(),
        reconciliation: ReconciliationState {
            last_updated,
            ..ReconciliationState::default()
        },
        raw_source_fields: RawSourceFields::default(),
    })
}
