//! caseflow-consolidator library interface
//!
//! Consolidation engine for case records: field normalization, projection,
//! duplicate resolution, status integration and the orchestrator that runs
//! them, plus the store access layer, ingestion admission and maintenance
//! passes.

pub mod db;
pub mod error;
pub mod ingest;
pub mod services;

pub use crate::error::{ConsolidationError, Result};

use caseflow_common::config::ConsolidationConfig;
use sqlx::SqlitePool;

/// Store handles shared by every component
#[derive(Debug, Clone)]
pub struct AppState {
    pub store: db::CaseStore,
    pub clients: db::ClientRegistry,
    pub audit: db::AuditLog,
    pub config: ConsolidationConfig,
}

impl AppState {
    pub fn new(pool: SqlitePool, config: ConsolidationConfig) -> Self {
        Self {
            store: db::CaseStore::new(pool.clone()),
            clients: db::ClientRegistry::new(pool.clone()),
            audit: db::AuditLog::new(pool),
            config,
        }
    }

    pub fn orchestrator(&self) -> services::ConsolidationOrchestrator {
        services::ConsolidationOrchestrator::new(
            self.store.clone(),
            self.clients.clone(),
            self.audit.clone(),
            self.config.projector_page_size,
        )
    }

    pub fn duplicate_repair(&self) -> services::StoreDuplicateRepair {
        services::StoreDuplicateRepair::new(self.store.clone(), self.audit.clone())
    }

    pub fn service_type_pass(&self) -> services::ServiceTypePass {
        services::ServiceTypePass::new(self.store.clone(), self.audit.clone())
    }

    pub fn billing_reset(&self) -> services::BillingReset {
        services::BillingReset::new(self.store.clone(), self.audit.clone())
    }

    pub fn ingest_admission(&self) -> ingest::IngestAdmission {
        ingest::IngestAdmission::new(self.store.clone(), self.audit.clone(), &self.config.default_client)
    }
}
