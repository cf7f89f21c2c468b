//! Service type normalization pass
//!
//! Rewrites the cached service type mirror onto the canonical vocabulary. Only
//! values that change are written.

use crate::db::{AuditEntry, AuditLog, CaseFilter, CaseStore};
use crate::error::Result;
use crate::services::normalizer::{normalize_client_code, normalize_service_type};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceTypeReport {
    /// Distinct values found
    pub distinct: usize,
    /// Distinct values that changed
    pub normalized: usize,
    /// Records rewritten
    pub updated: u64,
    /// Original value to canonical value
    pub mapping: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ServiceTypePass {
    store: CaseStore,
    audit: AuditLog,
}

impl ServiceTypePass {
    pub fn new(store: CaseStore, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    pub async fn run(&self, client_code: Option<&str>) -> Result<ServiceTypeReport> {
        let client_code = client_code.map(normalize_client_code);
        let filter = match &client_code {
            Some(code) => CaseFilter::for_client(code),
            None => CaseFilter::all(),
        };

        let values = self.store.distinct_service_types(&filter).await?;
        let mut report = ServiceTypeReport {
            distinct: values.len(),
            ..ServiceTypeReport::default()
        };

        for value in values {
            let Some(canonical) = normalize_service_type(Some(&value)) else {
                continue;
            };
            if canonical == value {
                continue;
            }

            let updated = self.store.update_service_type(&filter, &value, &canonical).await?;
            tracing::debug!(from = %value, to = %canonical, updated, "Normalized service type");

            report.updated += updated;
            report.mapping.insert(value, canonical);
        }
        report.normalized = report.mapping.len();

        self.audit
            .append(AuditEntry::new(
                "normalize_service_types",
                client_code.as_deref().unwrap_or("ALL"),
                serde_json::to_value(&report).unwrap_or_default(),
            ))
            .await;

        tracing::info!(
            distinct = report.distinct,
            normalized = report.normalized,
            updated = report.updated,
            "Service type normalization complete"
        );

        Ok(report)
    }
}
