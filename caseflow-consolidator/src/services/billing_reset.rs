//! Billing status audit and reset
//!
//! Compares the persisted `invoiced` flag against the evidence (invoices or
//! invoiced order lines) and, unless running dry, returns every flagged record
//! to `invoiced = false, completion_state = PENDING`. Order lines and invoices
//! are left untouched.

use crate::db::{AuditEntry, AuditLevel, AuditLog, CaseFieldSet, CaseFilter, CaseStore};
use crate::error::Result;
use caseflow_common::db::CompletionState;
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BillingAuditReport {
    pub total_records: i64,
    pub flagged_invoiced: i64,
    pub with_invoices: i64,
    pub with_invoiced_order_lines: i64,
    /// Records with invoices or invoiced order lines
    pub with_billing_evidence: i64,
    /// Flag count differs from evidence count
    pub inconsistent: bool,
    pub dry_run: bool,
    pub reset: u64,
    pub flagged_after: i64,
}

#[derive(Debug, Clone)]
pub struct BillingReset {
    store: CaseStore,
    audit: AuditLog,
}

impl BillingReset {
    pub fn new(store: CaseStore, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Count flags versus evidence without writing
    pub async fn audit_status(&self) -> Result<BillingAuditReport> {
        let total_records = self.store.count(&CaseFilter::all()).await?;
        let flagged_invoiced = self.store.count(&CaseFilter::all().with_invoiced(true)).await?;
        let with_invoices = self.store.count(&CaseFilter::all().with_has_invoices(true)).await?;
        let with_invoiced_order_lines = self
            .store
            .count(&CaseFilter::all().with_has_invoiced_order_lines(true))
            .await?;
        let lines_only = self
            .store
            .count(
                &CaseFilter::all()
                    .with_has_invoices(false)
                    .with_has_invoiced_order_lines(true),
            )
            .await?;

        let with_billing_evidence = with_invoices + lines_only;

        Ok(BillingAuditReport {
            total_records,
            flagged_invoiced,
            with_invoices,
            with_invoiced_order_lines,
            with_billing_evidence,
            inconsistent: flagged_invoiced != with_billing_evidence,
            dry_run: true,
            reset: 0,
            flagged_after: flagged_invoiced,
        })
    }

    /// Audit, then clear every `invoiced` flag unless `dry_run`
    pub async fn reset(&self, dry_run: bool) -> Result<BillingAuditReport> {
        let mut report = self.audit_status().await?;
        report.dry_run = dry_run;

        if report.inconsistent {
            tracing::warn!(
                flagged = report.flagged_invoiced,
                evidence = report.with_billing_evidence,
                "Invoiced flags disagree with billing evidence"
            );
        }

        if dry_run {
            tracing::info!(flagged = report.flagged_invoiced, "Dry run, no records reset");
            return Ok(report);
        }

        let fields = CaseFieldSet {
            invoiced: Some(false),
            completion_state: Some(CompletionState::Pending),
            ..CaseFieldSet::default()
        };
        report.reset = self
            .store
            .update_many(&CaseFilter::all().with_invoiced(true), &fields)
            .await?;
        report.flagged_after = self.store.count(&CaseFilter::all().with_invoiced(true)).await?;

        let level = if report.flagged_after == 0 {
            AuditLevel::Info
        } else {
            AuditLevel::Warning
        };
        self.audit
            .append(
                AuditEntry::new("billing_reset", "ALL", serde_json::to_value(&report).unwrap_or_default())
                    .with_level(level),
            )
            .await;

        tracing::info!(reset = report.reset, flagged_after = report.flagged_after, "Billing status reset");

        Ok(report)
    }
}
