//! Consolidation orchestrator
//!
//! Runs normalization, projection, duplicate resolution and status
//! integration for one client, strictly in sequence, accumulating a
//! [`ConsolidationSummary`]. Each stage appends one audit entry.
//!
//! A fatal error returns [`RunAborted`] carrying the stage that failed and the
//! summary accumulated so far. Writes made before the failure are not rolled
//! back.

use crate::db::{AuditEntry, AuditLevel, AuditLog, CaseStore, ClientRegistry};
use crate::error::ConsolidationError;
use crate::services::duplicate_resolver::resolve_in_memory;
use crate::services::normalizer::normalize_client_code;
use crate::services::record_projector::RecordProjector;
use crate::services::status_integrator::{rollup, MultiSourceRollup, StatusIntegrator};
use caseflow_common::time::now;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalization,
    Projection,
    Resolution,
    Integration,
    Rollup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Normalization => "normalization",
            Stage::Projection => "projection",
            Stage::Resolution => "resolution",
            Stage::Integration => "integration",
            Stage::Rollup => "rollup",
        }
    }

    fn audit_operation(&self) -> String {
        format!("consolidation.{}", self.as_str())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one completed stage
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Records the stage produced
    pub records: usize,
    pub details: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

/// Result of a consolidation run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsolidationSummary {
    pub run_id: Uuid,
    pub client_code: String,
    pub total_records: usize,
    pub canonical_records: usize,
    pub duplicate_records: usize,
    pub invalid_keys: usize,
    /// Records skipped because their stored columns could not be decoded
    pub undecodable_records: usize,
    pub not_found: usize,
    pub update_errors: usize,
    pub stages: Vec<StageReport>,
    pub processed_at: DateTime<Utc>,
}

impl ConsolidationSummary {
    fn new(run_id: Uuid, client_code: String) -> Self {
        Self {
            run_id,
            client_code,
            total_records: 0,
            canonical_records: 0,
            duplicate_records: 0,
            invalid_keys: 0,
            undecodable_records: 0,
            not_found: 0,
            update_errors: 0,
            stages: Vec::new(),
            processed_at: now(),
        }
    }
}

/// A run stopped by a fatal error
#[derive(Debug, Error)]
#[error("Consolidation run {run_id} aborted during {stage}: {error}")]
pub struct RunAborted {
    pub run_id: Uuid,
    pub stage: Stage,
    #[source]
    pub error: ConsolidationError,
    /// Everything accumulated before the failure
    pub partial: ConsolidationSummary,
}

/// Drives the consolidation pipeline
#[derive(Debug, Clone)]
pub struct ConsolidationOrchestrator {
    store: CaseStore,
    registry: ClientRegistry,
    audit: AuditLog,
    projector: RecordProjector,
    integrator: StatusIntegrator,
}

impl ConsolidationOrchestrator {
    pub fn new(store: CaseStore, registry: ClientRegistry, audit: AuditLog, page_size: i64) -> Self {
        Self {
            projector: RecordProjector::new(store.clone(), page_size),
            integrator: StatusIntegrator::new(store.clone()),
            store,
            registry,
            audit,
        }
    }

    /// Consolidate one client's records
    pub async fn run_consolidation(&self, raw_client_code: &str) -> Result<ConsolidationSummary, RunAborted> {
        let run_id = Uuid::new_v4();
        let client_code = normalize_client_code(raw_client_code);
        let mut summary = ConsolidationSummary::new(run_id, client_code.clone());

        tracing::info!(run_id = %run_id, client_code = %client_code, "Starting consolidation run");

        // Stage 1: normalization
        if client_code.is_empty() {
            return Err(self
                .abort(
                    summary,
                    Stage::Normalization,
                    ConsolidationError::InvalidKey {
                        raw_case_number: String::new(),
                        raw_client_code: raw_client_code.to_string(),
                    },
                )
                .await);
        }
        self.complete_stage(
            &mut summary,
            Stage::Normalization,
            1,
            json!({ "raw_client_code": raw_client_code, "client_code": client_code }),
        )
        .await;

        // Stage 2: projection
        let projection = match self.projector.project_all(&client_code).await {
            Ok(projection) => projection,
            Err(e) => return Err(self.abort(summary, Stage::Projection, e).await),
        };
        let projected_count = projection.records.len();
        summary.undecodable_records = projection.skipped.len();
        self.complete_stage(
            &mut summary,
            Stage::Projection,
            projected_count,
            json!({
                "records": projected_count,
                "undecodable": projection.skipped.len(),
                "errors": projection.skipped.iter().map(ToString::to_string).collect::<Vec<_>>(),
            }),
        )
        .await;

        // Stage 3: in-memory duplicate resolution
        let resolution = resolve_in_memory(projection.records);
        summary.total_records = resolution.total_processed;
        summary.canonical_records = resolution.canonical_records.len();
        summary.duplicate_records = resolution.duplicates.len();
        summary.invalid_keys = resolution.invalid_keys.len();
        self.complete_stage(
            &mut summary,
            Stage::Resolution,
            resolution.canonical_records.len() + resolution.duplicates.len(),
            json!({
                "total_processed": resolution.total_processed,
                "canonical": resolution.canonical_records.len(),
                "duplicates": resolution.duplicates.len(),
                "invalid_keys": resolution.invalid_keys.len(),
            }),
        )
        .await;

        // Stage 4: status integration
        let run_at = now();
        match self.integrator.integrate(&resolution, run_at).await {
            Ok(report) => {
                summary.not_found = report.not_found;
                summary.update_errors = report.update_errors;
                self.complete_stage(
                    &mut summary,
                    Stage::Integration,
                    report.updated,
                    serde_json::to_value(&report).unwrap_or_default(),
                )
                .await;
            }
            Err(aborted) => {
                summary.not_found = aborted.partial.not_found;
                summary.update_errors = aborted.partial.update_errors;
                return Err(self.abort(summary, Stage::Integration, aborted.error).await);
            }
        }

        summary.processed_at = now();

        tracing::info!(
            run_id = %run_id,
            client_code = %summary.client_code,
            total_records = summary.total_records,
            canonical_records = summary.canonical_records,
            duplicate_records = summary.duplicate_records,
            invalid_keys = summary.invalid_keys,
            undecodable_records = summary.undecodable_records,
            not_found = summary.not_found,
            update_errors = summary.update_errors,
            "Consolidation run complete"
        );

        Ok(summary)
    }

    /// Roll up persisted classification counts across clients
    ///
    /// Without an explicit list, every active client in the registry is
    /// included. Nothing is re-resolved.
    pub async fn run_multi_source_consolidation(
        &self,
        client_codes: Option<Vec<String>>,
    ) -> crate::error::Result<MultiSourceRollup> {
        let clients = match client_codes {
            Some(codes) => codes,
            None => self.registry.active_clients().await?,
        };

        tracing::info!(clients = clients.len(), "Starting multi-source rollup");

        let result = rollup(&self.store, &clients).await?;

        self.audit
            .append(AuditEntry::new(
                &Stage::Rollup.audit_operation(),
                "GLOBAL",
                json!({
                    "client_count": result.client_count,
                    "total": result.grand_total.total,
                    "canonical": result.grand_total.canonical,
                    "duplicate": result.grand_total.duplicate,
                    "unclassified": result.grand_total.unclassified,
                }),
            ))
            .await;

        tracing::info!(
            client_count = result.client_count,
            total = result.grand_total.total,
            canonical = result.grand_total.canonical,
            duplicate = result.grand_total.duplicate,
            unclassified = result.grand_total.unclassified,
            "Multi-source rollup complete"
        );

        Ok(result)
    }

    async fn complete_stage(
        &self,
        summary: &mut ConsolidationSummary,
        stage: Stage,
        records: usize,
        details: serde_json::Value,
    ) {
        tracing::info!(run_id = %summary.run_id, stage = %stage, records, "Stage complete");

        let mut audit_details = details.clone();
        if let Some(map) = audit_details.as_object_mut() {
            map.insert("run_id".to_string(), json!(summary.run_id));
        }
        self.audit
            .append(AuditEntry::new(&stage.audit_operation(), &summary.client_code, audit_details))
            .await;

        summary.stages.push(StageReport {
            stage,
            records,
            details,
            completed_at: now(),
        });
    }

    async fn abort(&self, mut summary: ConsolidationSummary, stage: Stage, error: ConsolidationError) -> RunAborted {
        summary.processed_at = now();

        tracing::error!(
            run_id = %summary.run_id,
            client_code = %summary.client_code,
            stage = %stage,
            error = %error,
            "Consolidation run aborted"
        );

        self.audit
            .append(
                AuditEntry::new(
                    &stage.audit_operation(),
                    &summary.client_code,
                    json!({
                        "run_id": summary.run_id,
                        "error": error.to_string(),
                        "completed_stages": summary.stages.len(),
                    }),
                )
                .with_level(AuditLevel::Error),
            )
            .await;

        RunAborted {
            run_id: summary.run_id,
            stage,
            error,
            partial: summary,
        }
    }
}
