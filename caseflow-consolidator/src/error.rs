//! Error types for the consolidation engine
//!
//! Two severities:
//! - `InvalidKey`, `PerRecordUpdate` and `Ingest` are counted and the pass
//!   continues
//! - `StoreUnavailable` aborts the pass (see [`crate::services::orchestrator::RunAborted`])

use thiserror::Error;

/// Consolidation engine error
#[derive(Debug, Error)]
pub enum ConsolidationError {
    /// Business key normalized to empty
    #[error("Invalid business key: case number '{raw_case_number}', client '{raw_client_code}'")]
    InvalidKey {
        raw_case_number: String,
        raw_client_code: String,
    },

    /// The store could not be reached or refused a read
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] caseflow_common::Error),

    /// A single record could not be read back or written
    #[error("Record {record_id} failed: {source}")]
    PerRecordUpdate {
        record_id: i64,
        #[source]
        source: caseflow_common::Error,
    },

    /// An ingestion row was rejected at admission
    #[error("Ingest rejected: {0}")]
    Ingest(String),
}

impl ConsolidationError {
    /// Errors the pipeline counts instead of aborting on
    pub fn is_counted(&self) -> bool {
        matches!(
            self,
            ConsolidationError::InvalidKey { .. }
                | ConsolidationError::PerRecordUpdate { .. }
                | ConsolidationError::Ingest(_)
        )
    }
}

impl From<caseflow_common::Error> for ConsolidationError {
    fn from(err: caseflow_common::Error) -> Self {
        ConsolidationError::StoreUnavailable(err)
    }
}

/// Result alias for engine operations
pub type Result<T> = std::result::Result<T, ConsolidationError>;
