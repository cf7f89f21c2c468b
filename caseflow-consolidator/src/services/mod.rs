//! Consolidation pipeline components and maintenance passes

pub mod billing_reset;
pub mod duplicate_resolver;
pub mod integrity;
pub mod normalizer;
pub mod orchestrator;
pub mod record_projector;
pub mod service_type_pass;
pub mod status_integrator;

pub use billing_reset::{BillingAuditReport, BillingReset};
pub use duplicate_resolver::{resolve_in_memory, RepairReport, Resolution, StoreDuplicateRepair};
pub use integrity::{scan_client, IntegrityReport, RecordIntegrity};
pub use orchestrator::{ConsolidationOrchestrator, ConsolidationSummary, RunAborted, Stage, StageReport};
pub use record_projector::{ProjectedRecord, Projection, RecordProjector};
pub use service_type_pass::{ServiceTypePass, ServiceTypeReport};
pub use status_integrator::{derive_billing_status, rollup, MultiSourceRollup, StatusIntegrator};
