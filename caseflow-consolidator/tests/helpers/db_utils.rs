//! Database Test Utilities

use caseflow_common::config::ConsolidationConfig;
use caseflow_common::db::{create_schema, BusinessKey, CaseRecord, Classification, DuplicateReason};
use caseflow_consolidator::db::{CaseFieldSet, CaseFilter};
use caseflow_consolidator::AppState;
use sqlx::sqlite::SqlitePoolOptions;

/// Fresh in-memory database with the schema applied
///
/// A single connection keeps every query on the same in-memory database.
pub async fn memory_state() -> AppState {
    memory_state_with(ConsolidationConfig::default()).await
}

pub async fn memory_state_with(config: ConsolidationConfig) -> AppState {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    create_schema(&pool).await.unwrap();
    AppState::new(pool, config)
}

pub async fn record_by_id(state: &AppState, id: i64) -> CaseRecord {
    state
        .store
        .find_one(&CaseFilter::by_id(id))
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("record {} not found", id))
}

/// Force a record's classification flags
pub async fn classify(state: &AppState, id: i64, classification: Classification) {
    let fields = match classification {
        Classification::Canonical => CaseFieldSet {
            is_canonical: Some(true),
            is_duplicate: Some(false),
            ..CaseFieldSet::default()
        },
        Classification::Duplicate => CaseFieldSet {
            is_canonical: Some(false),
            is_duplicate: Some(true),
            duplicate_reason: Some(Some(DuplicateReason::PriorVersion)),
            canonical_reference: Some(Some(BusinessKey::new("00000000", "TEST"))),
            ..CaseFieldSet::default()
        },
        Classification::Unclassified => CaseFieldSet::default(),
    };
    if fields.is_empty() {
        return;
    }
    state
        .store
        .find_one_and_update(&CaseFilter::by_id(id), &fields, false)
        .await
        .unwrap()
        .unwrap();
}

/// Make the store refuse updates to records of `case_number`
///
/// The rejection comes back as a statement error, like a constraint violation.
pub async fn refuse_updates(state: &AppState, case_number: &str) {
    refuse_writes(state, "UPDATE", "OLD", case_number).await;
}

/// Make the store refuse inserts of records with `case_number`
pub async fn refuse_inserts(state: &AppState, case_number: &str) {
    refuse_writes(state, "INSERT", "NEW", case_number).await;
}

async fn refuse_writes(state: &AppState, event: &str, row: &str, case_number: &str) {
    let sql = format!(
        "CREATE TRIGGER refuse_{event}_{case_number} BEFORE {event} ON case_records \
         WHEN {row}.case_number = '{case_number}' \
         BEGIN SELECT RAISE(ABORT, 'record locked'); END"
    );
    sqlx::query(&sql).execute(state.store.pool()).await.unwrap();
}

/// Overwrite one stored column with a raw value
pub async fn corrupt_column(state: &AppState, id: i64, column: &str, value: &str) {
    let sql = format!("UPDATE case_records SET {column} = ? WHERE id = ?");
    sqlx::query(&sql)
        .bind(value)
        .bind(id)
        .execute(state.store.pool())
        .await
        .unwrap();
}
