//! Status integration
//!
//! Persists resolver verdicts and recomputes each record's billing status with
//! field-level updates, plus the read-only multi-source rollup.
//!
//! Billing status rules:
//! - `invoiced`: the record has invoices, or any order line is `INVOICED` or
//!   `INVOICED_BY_CASE`
//! - `COMPLETE`: invoiced and invoice total >= order total
//! - `PARTIAL`: invoiced otherwise
//! - `PENDING`: not invoiced
//!
//! `COMPLETE` therefore always implies `invoiced`.

use crate::db::{Accumulators, CaseFieldSet, CaseFilter, CaseStore, GroupKey, GroupKeyValue};
use crate::error::ConsolidationError;
use crate::services::duplicate_resolver::Resolution;
use crate::services::normalizer::normalize_client_code;
use caseflow_common::db::{BusinessKey, Classification, CompletionState, DuplicateReason, Invoice, OrderLine};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Derived billing status of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingStatus {
    pub invoiced: bool,
    pub completion_state: CompletionState,
}

/// Derive billing status from a record's order lines and invoices
///
/// Missing prices and amounts count as zero.
pub fn derive_billing_status(order_lines: &[OrderLine], invoices: &[Invoice]) -> BillingStatus {
    let invoiced = !invoices.is_empty() || order_lines.iter().any(|line| line.status.is_invoiced());

    let order_total: Decimal = order_lines.iter().filter_map(|line| line.price).sum();
    let invoice_total: Decimal = invoices.iter().filter_map(|invoice| invoice.amount).sum();

    let completion_state = if !invoiced {
        CompletionState::Pending
    } else if invoice_total >= order_total {
        CompletionState::Complete
    } else {
        CompletionState::Partial
    };

    BillingStatus {
        invoiced,
        completion_state,
    }
}

/// Classification decided for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Canonical,
    Duplicate {
        reason: DuplicateReason,
        canonical_reference: BusinessKey,
    },
}

impl Verdict {
    fn field_set(&self, status: BillingStatus, run_at: DateTime<Utc>) -> CaseFieldSet {
        let base = CaseFieldSet {
            invoiced: Some(status.invoiced),
            completion_state: Some(status.completion_state),
            last_consolidation_run: Some(run_at),
            ..CaseFieldSet::default()
        };

        match self {
            Verdict::Canonical => CaseFieldSet {
                is_canonical: Some(true),
                is_duplicate: Some(false),
                duplicate_reason: Some(None),
                canonical_reference: Some(None),
                ..base
            },
            Verdict::Duplicate {
                reason,
                canonical_reference,
            } => CaseFieldSet {
                is_canonical: Some(false),
                is_duplicate: Some(true),
                duplicate_reason: Some(Some(*reason)),
                canonical_reference: Some(Some(canonical_reference.clone())),
                ..base
            },
        }
    }
}

/// Counts from one integration pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IntegrationReport {
    pub updated: usize,
    pub canonical_written: usize,
    pub duplicates_written: usize,
    /// Records deleted since projection
    pub not_found: usize,
    pub update_errors: usize,
}

/// Integration stopped because the store became unavailable
#[derive(Debug)]
pub struct IntegrationAborted {
    pub error: ConsolidationError,
    /// Counts for the records written before the failure
    pub partial: IntegrationReport,
}

/// Writes verdicts and billing status back to the store
#[derive(Debug, Clone)]
pub struct StatusIntegrator {
    store: CaseStore,
}

impl StatusIntegrator {
    pub fn new(store: CaseStore) -> Self {
        Self { store }
    }

    /// Apply every verdict in `resolution`
    ///
    /// Missing records and rejected writes are counted. A connection-level
    /// failure stops the pass; writes already made are kept.
    pub async fn integrate(
        &self,
        resolution: &Resolution,
        run_at: DateTime<Utc>,
    ) -> std::result::Result<IntegrationReport, IntegrationAborted> {
        let mut report = IntegrationReport::default();

        let canonical = resolution
            .canonical_records
            .iter()
            .map(|c| (&c.projected, Verdict::Canonical));
        let duplicates = resolution.duplicates.iter().map(|d| {
            (
                &d.projected,
                Verdict::Duplicate {
                    reason: d.reason,
                    canonical_reference: d.canonical_reference.clone(),
                },
            )
        });

        for (projected, verdict) in canonical.chain(duplicates) {
            let record = &projected.record;
            let status = derive_billing_status(&record.order_lines, &record.invoices);
            let fields = verdict.field_set(status, run_at);

            match self
                .store
                .find_one_and_update(&CaseFilter::by_id(record.id), &fields, false)
                .await
            {
                Ok(Some(_)) => {
                    report.updated += 1;
                    match verdict {
                        Verdict::Canonical => report.canonical_written += 1,
                        Verdict::Duplicate { .. } => report.duplicates_written += 1,
                    }
                    tracing::debug!(
                        record_id = record.id,
                        invoiced = status.invoiced,
                        completion_state = status.completion_state.as_str(),
                        "Integrated record"
                    );
                }
                Ok(None) => {
                    tracing::warn!(record_id = record.id, "Record disappeared before integration");
                    report.not_found += 1;
                }
                Err(e) if e.is_store_failure() => {
                    return Err(IntegrationAborted {
                        error: ConsolidationError::StoreUnavailable(e),
                        partial: report,
                    });
                }
                Err(e) => {
                    let err = ConsolidationError::PerRecordUpdate {
                        record_id: record.id,
                        source: e,
                    };
                    tracing::warn!(error = %err, "Record update failed");
                    report.update_errors += 1;
                }
            }
        }

        Ok(report)
    }
}

/// Record counts by classification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationCounts {
    pub total: i64,
    pub canonical: i64,
    pub duplicate: i64,
    pub unclassified: i64,
}

impl ClassificationCounts {
    fn add(&mut self, classification: Classification, count: i64) {
        self.total += count;
        match classification {
            Classification::Canonical => self.canonical += count,
            Classification::Duplicate => self.duplicate += count,
            Classification::Unclassified => self.unclassified += count,
        }
    }

    fn absorb(&mut self, other: &ClassificationCounts) {
        self.total += other.total;
        self.canonical += other.canonical;
        self.duplicate += other.duplicate;
        self.unclassified += other.unclassified;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientRollup {
    pub client_code: String,
    #[serde(flatten)]
    pub counts: ClassificationCounts,
}

/// Multi-source rollup across clients
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MultiSourceRollup {
    pub clients: Vec<ClientRollup>,
    pub grand_total: ClassificationCounts,
    pub client_count: usize,
}

/// Count records by classification for each client; read-only
pub async fn rollup(store: &CaseStore, client_codes: &[String]) -> caseflow_common::Result<MultiSourceRollup> {
    let mut result = MultiSourceRollup::default();

    for raw in client_codes {
        let client_code = normalize_client_code(raw);
        let groups = store
            .aggregate_group_by(
                &CaseFilter::for_client(&client_code),
                GroupKey::Classification,
                Accumulators::count_only(),
            )
            .await?;

        let mut counts = ClassificationCounts::default();
        for group in &groups {
            if let GroupKeyValue::Classification(classification) = group.key {
                counts.add(classification, group.count);
            }
        }

        tracing::debug!(
            client_code = %client_code,
            total = counts.total,
            canonical = counts.canonical,
            duplicate = counts.duplicate,
            unclassified = counts.unclassified,
            "Client rollup"
        );

        result.grand_total.absorb(&counts);
        result.clients.push(ClientRollup { client_code, counts });
    }

    result.client_count = result.clients.len();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caseflow_common::db::OrderStatus;
    use std::str::FromStr;

    fn line(price: Option<&str>, status: OrderStatus) -> OrderLine {
        OrderLine {
            order_number: "0000000001".to_string(),
            date: None,
            price: price.map(|p| Decimal::from_str(p).unwrap()),
            status,
            invoice_reference: None,
        }
    }

    fn invoice(amount: Option<&str>) -> Invoice {
        Invoice {
            invoice_number: "F-1".to_string(),
            date: None,
            amount: amount.map(|a| Decimal::from_str(a).unwrap()),
        }
    }

    #[test]
    fn test_fully_invoiced_is_complete() {
        let status = derive_billing_status(&[line(Some("1500.00"), OrderStatus::Invoiced)], &[invoice(Some("1500.00"))]);
        assert!(status.invoiced);
        assert_eq!(status.completion_state, CompletionState::Complete);
    }

    #[test]
    fn test_no_invoices_is_pending() {
        let status = derive_billing_status(&[line(Some("1500.00"), OrderStatus::NotInvoiced)], &[]);
        assert!(!status.invoiced);
        assert_eq!(status.completion_state, CompletionState::Pending);
    }

    #[test]
    fn test_short_invoice_is_partial() {
        let status = derive_billing_status(
            &[
                line(Some("1000.00"), OrderStatus::NotInvoiced),
                line(Some("500.00"), OrderStatus::NotInvoiced),
            ],
            &[invoice(Some("300.00"))],
        );
        assert!(status.invoiced);
        assert_eq!(status.completion_state, CompletionState::Partial);
    }

    #[test]
    fn test_invoiced_line_without_invoice() {
        let status = derive_billing_status(&[line(Some("200.00"), OrderStatus::InvoicedByCase)], &[]);
        assert!(status.invoiced);
        assert_eq!(status.completion_state, CompletionState::Partial);

        let free = derive_billing_status(&[line(None, OrderStatus::Invoiced)], &[]);
        assert_eq!(free.completion_state, CompletionState::Complete);
    }

    #[test]
    fn test_complete_implies_invoiced_across_combinations() {
        let prices = [None, Some("0.00"), Some("100.00"), Some("1500.00")];
        let amounts = [None, Some("0.00"), Some("99.99"), Some("1500.00")];
        let statuses = [OrderStatus::NotInvoiced, OrderStatus::Invoiced, OrderStatus::InvoicedByCase];

        for price in prices {
            for status in statuses {
                for line_count in 0..3 {
                    for amount in amounts {
                        for invoice_count in 0..3 {
                            let lines: Vec<OrderLine> = (0..line_count).map(|_| line(price, status)).collect();
                            let invoices: Vec<Invoice> = (0..invoice_count).map(|_| invoice(amount)).collect();
                            let derived = derive_billing_status(&lines, &invoices);

                            if derived.completion_state == CompletionState::Complete {
                                assert!(derived.invoiced);
                            }
                            if !derived.invoiced {
                                assert_eq!(derived.completion_state, CompletionState::Pending);
                            }
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_verdict_field_sets() {
        let run_at = Utc::now();
        let status = BillingStatus {
            invoiced: true,
            completion_state: CompletionState::Complete,
        };

        let canonical = Verdict::Canonical.field_set(status, run_at);
        assert_eq!(canonical.is_canonical, Some(true));
        assert_eq!(canonical.canonical_reference, Some(None));

        let key = BusinessKey::new("00000001", "IKE");
        let duplicate = Verdict::Duplicate {
            reason: DuplicateReason::PriorVersion,
            canonical_reference: key.clone(),
        }
        .field_set(status, run_at);
        assert_eq!(duplicate.is_duplicate, Some(true));
        assert_eq!(duplicate.duplicate_reason, Some(Some(DuplicateReason::PriorVersion)));
        assert_eq!(duplicate.canonical_reference, Some(Some(key)));
        assert_eq!(duplicate.last_consolidation_run, Some(run_at));
    }
}
