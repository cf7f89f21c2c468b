//! Record projection
//!
//! Reads a client's case records page by page, most recently updated first,
//! and enriches each with the derived values the resolver and integrator need.
//! Read-only against the store.
//!
//! A record whose stored columns cannot be decoded is skipped and reported as
//! a per-record error; only a failed query ends the pass.

use crate::db::{CaseFilter, CaseSort, CaseStore};
use crate::error::{ConsolidationError, Result};
use crate::services::normalizer::normalize_client_code;
use caseflow_common::db::CaseRecord;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use rust_decimal::Decimal;

/// A case record with its derived values
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedRecord {
    pub record: CaseRecord,
    /// Invoices are present
    pub invoiced: bool,
    pub total_order_amount: Decimal,
    pub total_invoice_amount: Decimal,
    /// Latest of last update, order-line dates and invoice dates
    pub most_recent_timestamp: Option<DateTime<Utc>>,
}

impl ProjectedRecord {
    pub fn from_record(record: CaseRecord) -> Self {
        let total_order_amount = record
            .order_lines
            .iter()
            .filter_map(|line| line.price)
            .sum();
        let total_invoice_amount = record
            .invoices
            .iter()
            .filter_map(|invoice| invoice.amount)
            .sum();

        let most_recent_timestamp = std::iter::once(record.reconciliation.last_updated)
            .chain(record.order_lines.iter().map(|line| line.date))
            .chain(record.invoices.iter().map(|invoice| invoice.date))
            .flatten()
            .max();

        Self {
            invoiced: !record.invoices.is_empty(),
            total_order_amount,
            total_invoice_amount,
            most_recent_timestamp,
            record,
        }
    }
}

/// Paged reader over one client's records
#[derive(Debug, Clone)]
pub struct RecordProjector {
    store: CaseStore,
    page_size: i64,
}

impl RecordProjector {
    pub fn new(store: CaseStore, page_size: i64) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Lazy stream of projected records for `client_code`
    ///
    /// The client code is normalized before querying. Each call starts a fresh
    /// pass from the first page. Undecodable records are yielded as
    /// [`ConsolidationError::PerRecordUpdate`] and the stream goes on; a store
    /// failure is yielded as [`ConsolidationError::StoreUnavailable`] and ends
    /// the stream.
    pub fn project(&self, client_code: &str) -> impl Stream<Item = Result<ProjectedRecord>> {
        let store = self.store.clone();
        let page_size = self.page_size;
        let filter = CaseFilter::for_client(&normalize_client_code(client_code));

        async_stream::stream! {
            let mut skip = 0i64;
            loop {
                let page = match store
                    .find_decoded(&filter, CaseSort::LastUpdatedDesc, skip, Some(page_size))
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(ConsolidationError::StoreUnavailable(e));
                        return;
                    }
                };
                let fetched = page.len() as i64;

                tracing::debug!(
                    client_code = filter.client_code.as_deref().unwrap_or_default(),
                    skip,
                    fetched,
                    "Fetched projection page"
                );

                for row in page {
                    match row.record {
                        Ok(record) => {
                            yield Ok(ProjectedRecord::from_record(record));
                        }
                        Err(source) if source.is_store_failure() => {
                            yield Err(ConsolidationError::StoreUnavailable(source));
                            return;
                        }
                        Err(source) => {
                            tracing::warn!(record_id = row.id, error = %source, "Skipping undecodable record");
                            yield Err(ConsolidationError::PerRecordUpdate {
                                record_id: row.id,
                                source,
                            });
                        }
                    }
                }

                if fetched < page_size {
                    break;
                }
                skip += fetched;
            }
        }
    }

    /// Drain [`Self::project`], setting aside counted errors
    pub async fn project_all(&self, client_code: &str) -> Result<Projection> {
        let mut projection = Projection::default();
        let stream = self.project(client_code);
        futures::pin_mut!(stream);

        while let Some(item) = stream.next().await {
            match item {
                Ok(projected) => projection.records.push(projected),
                Err(e) if e.is_counted() => projection.skipped.push(e),
                Err(e) => return Err(e),
            }
        }

        Ok(projection)
    }
}

/// Everything one projection pass produced
#[derive(Debug, Default)]
pub struct Projection {
    pub records: Vec<ProjectedRecord>,
    /// Records that could not be decoded
    pub skipped: Vec<ConsolidationError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_common::db::{
        BusinessKey, Invoice, OrderLine, OrderStatus, RawSourceFields, ReconciliationState,
        ServiceData,
    };
    use chrono::TimeZone;
    use std::str::FromStr;

    fn record(last_updated: Option<DateTime<Utc>>) -> CaseRecord {
        CaseRecord {
            id: 1,
            key: BusinessKey::new("00000001", "IKE"),
            source: None,
            service_data: ServiceData::default(),
            order_lines: Vec::new(),
            invoices: Vec::new(),
            reconciliation: ReconciliationState {
                last_updated,
                ..ReconciliationState::default()
            },
            raw_source_fields: RawSourceFields::default(),
        }
    }

    #[test]
    fn test_totals_treat_missing_amounts_as_zero() {
        let mut rec = record(None);
        rec.order_lines = vec![
            OrderLine {
                order_number: "0000000001".to_string(),
                date: None,
                price: Some(Decimal::from_str("100.50").unwrap()),
                status: OrderStatus::NotInvoiced,
                invoice_reference: None,
            },
            OrderLine {
                order_number: "0000000002".to_string(),
                date: None,
                price: None,
                status: OrderStatus::NotInvoiced,
                invoice_reference: None,
            },
        ];
        rec.invoices = vec![Invoice {
            invoice_number: "F-1".to_string(),
            date: None,
            amount: None,
        }];

        let projected = ProjectedRecord::from_record(rec);
        assert_eq!(projected.total_order_amount, Decimal::from_str("100.50").unwrap());
        assert_eq!(projected.total_invoice_amount, Decimal::ZERO);
        assert!(projected.invoiced);
        assert_eq!(projected.most_recent_timestamp, None);
    }

    #[test]
    fn test_most_recent_timestamp_spans_lines_and_invoices() {
        let updated = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let invoice_date = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

        let mut rec = record(Some(updated));
        rec.order_lines = vec![OrderLine {
            order_number: "0000000001".to_string(),
            date: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            price: None,
            status: OrderStatus::Invoiced,
            invoice_reference: None,
        }];
        rec.invoices = vec![Invoice {
            invoice_number: "F-1".to_string(),
            date: Some(invoice_date),
            amount: None,
        }];

        let projected = ProjectedRecord::from_record(rec);
        assert_eq!(projected.most_recent_timestamp, Some(invoice_date));
    }

    #[test]
    fn test_invoiced_only_counts_invoices() {
        let mut rec = record(None);
        rec.order_lines = vec![OrderLine {
            order_number: "0000000001".to_string(),
            date: None,
            price: None,
            status: OrderStatus::Invoiced,
            invoice_reference: None,
        }];

        assert!(!ProjectedRecord::from_record(rec).invoiced);
    }
}
