//! Store access for the consolidation engine

pub mod audit_log;
pub mod case_store;
pub mod clients;

pub use audit_log::{AuditEntry, AuditLevel, AuditLog};
pub use case_store::{
    Accumulators, CaseFieldSet, CaseFilter, CaseSort, CaseStore, DecodedRow, GroupKey, GroupKeyValue,
    GroupMember, GroupSummary,
};
pub use clients::ClientRegistry;
