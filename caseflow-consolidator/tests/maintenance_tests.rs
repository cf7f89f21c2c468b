//! Duplicate repair, maintenance pass and ingestion tests

mod helpers;

use caseflow_common::config::DedupScope;
use caseflow_common::db::{
    BusinessKey, Classification, CompletionState, DuplicateReason, OrderStatus, RawSourceFields, RawValue,
};
use caseflow_consolidator::db::{AuditLevel, CaseFieldSet, CaseFilter};
use caseflow_consolidator::ingest::{IngestRow, RawOrderLine};
use caseflow_consolidator::services::scan_client;
use caseflow_consolidator::ConsolidationError;
use helpers::*;

fn text(s: &str) -> RawValue {
    RawValue::Text(s.to_string())
}

#[tokio::test]
async fn test_repair_per_client_keeps_clients_apart() {
    let state = memory_state().await;
    let ike_old = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 1, 1)).insert(&state).await;
    let ike_new = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 2, 1)).insert(&state).await;
    let axa = RecordBuilder::new("00000001", "AXA").last_updated(ts(2024, 3, 1)).insert(&state).await;

    let report = state
        .duplicate_repair()
        .repair(DedupScope::PerClient, None)
        .await
        .unwrap();

    assert_eq!(report.groups, 1);
    assert_eq!(report.duplicates_marked, 1);
    assert_eq!(report.records_updated, 2);
    assert_eq!(report.failed_groups, 0);

    assert_eq!(record_by_id(&state, ike_new).await.reconciliation.is_canonical, Some(true));
    let old = record_by_id(&state, ike_old).await;
    assert_eq!(old.reconciliation.duplicate_reason, Some(DuplicateReason::PriorVersion));
    assert_eq!(old.reconciliation.canonical_reference, Some(BusinessKey::new("00000001", "IKE")));
    // Singleton groups are left alone
    assert_eq!(
        record_by_id(&state, axa).await.reconciliation.classification(),
        Classification::Unclassified
    );
}

#[tokio::test]
async fn test_repair_global_groups_across_clients() {
    let state = memory_state().await;
    let ike_old = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 1, 1)).insert(&state).await;
    let ike_new = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 2, 1)).insert(&state).await;
    let axa = RecordBuilder::new("00000001", "AXA").last_updated(ts(2024, 3, 1)).insert(&state).await;

    let report = state
        .duplicate_repair()
        .repair(DedupScope::Global, None)
        .await
        .unwrap();

    assert_eq!(report.scope, DedupScope::Global);
    assert_eq!(report.groups, 1);
    assert_eq!(report.duplicates_marked, 2);
    assert_eq!(report.records_updated, 3);

    assert_eq!(record_by_id(&state, axa).await.reconciliation.is_canonical, Some(true));
    for id in [ike_old, ike_new] {
        let record = record_by_id(&state, id).await;
        assert_eq!(record.reconciliation.is_duplicate, Some(true));
        assert_eq!(
            record.reconciliation.canonical_reference,
            Some(BusinessKey::new("00000001", "AXA"))
        );
    }
}

#[tokio::test]
async fn test_repair_ties_go_to_lowest_id_and_missing_timestamps_lose() {
    let state = memory_state().await;
    let undated = RecordBuilder::new("00000001", "IKE").insert(&state).await;
    let first = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 1, 1)).insert(&state).await;
    let second = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 1, 1)).insert(&state).await;

    state
        .duplicate_repair()
        .repair(DedupScope::PerClient, Some("ike"))
        .await
        .unwrap();

    assert_eq!(record_by_id(&state, first).await.reconciliation.is_canonical, Some(true));
    assert_eq!(record_by_id(&state, second).await.reconciliation.is_duplicate, Some(true));
    assert_eq!(record_by_id(&state, undated).await.reconciliation.is_duplicate, Some(true));

    let entries = state.audit.recent("IKE", 5).await.unwrap();
    assert_eq!(entries[0].operation, "repair_duplicates");
    assert_eq!(entries[0].details["duplicates_marked"], serde_json::json!(2));
}

#[tokio::test]
async fn test_repair_isolates_a_failing_group() {
    let state = memory_state().await;
    let old = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 1, 1)).insert(&state).await;
    let new = RecordBuilder::new("00000001", "IKE").last_updated(ts(2024, 2, 1)).insert(&state).await;
    let locked_a = RecordBuilder::new("00000002", "IKE").last_updated(ts(2024, 1, 1)).insert(&state).await;
    let locked_b = RecordBuilder::new("00000002", "IKE").last_updated(ts(2024, 2, 1)).insert(&state).await;
    refuse_updates(&state, "00000002").await;

    let report = state
        .duplicate_repair()
        .repair(DedupScope::PerClient, Some("IKE"))
        .await
        .unwrap();

    assert_eq!(report.groups, 2);
    assert_eq!(report.failed_groups, 1);
    assert_eq!(report.duplicates_marked, 1);
    assert_eq!(report.records_updated, 2);

    assert_eq!(record_by_id(&state, new).await.reconciliation.is_canonical, Some(true));
    assert_eq!(record_by_id(&state, old).await.reconciliation.is_duplicate, Some(true));
    for id in [locked_a, locked_b] {
        assert_eq!(
            record_by_id(&state, id).await.reconciliation.classification(),
            Classification::Unclassified
        );
    }

    let entries = state.audit.recent("IKE", 5).await.unwrap();
    assert_eq!(entries[0].operation, "repair_duplicates");
    assert_eq!(entries[0].level, AuditLevel::Warning);
}

#[tokio::test]
async fn test_repair_aborts_when_store_unavailable() {
    let state = memory_state().await;
    RecordBuilder::new("00000001", "IKE").insert(&state).await;
    RecordBuilder::new("00000001", "IKE").insert(&state).await;
    state.store.pool().close().await;

    let err = state
        .duplicate_repair()
        .repair(DedupScope::PerClient, None)
        .await
        .unwrap_err();

    assert!(matches!(err, ConsolidationError::StoreUnavailable(_)));
    assert!(!err.is_counted());
}

#[tokio::test]
async fn test_service_type_pass_rewrites_only_changed_values() {
    let state = memory_state().await;
    RecordBuilder::new("00000001", "IKE").service_type("Arrastre local").insert(&state).await;
    RecordBuilder::new("00000002", "IKE").service_type("arrastre").insert(&state).await;
    RecordBuilder::new("00000003", "IKE").service_type("GRUA").insert(&state).await;
    RecordBuilder::new("00000004", "IKE").service_type("paso de corriente").insert(&state).await;

    let report = state.service_type_pass().run(Some("IKE")).await.unwrap();

    assert_eq!(report.distinct, 4);
    assert_eq!(report.normalized, 3);
    assert_eq!(report.updated, 3);
    assert_eq!(report.mapping.get("Arrastre local").map(String::as_str), Some("ARRASTRE"));
    assert_eq!(report.mapping.get("paso de corriente").map(String::as_str), Some("PASO DE CORRIENTE"));
    assert!(!report.mapping.contains_key("GRUA"));

    let values = state.store.distinct_service_types(&CaseFilter::all()).await.unwrap();
    assert_eq!(values, vec!["ARRASTRE", "GRUA", "PASO DE CORRIENTE"]);
}

#[tokio::test]
async fn test_integrity_scan_reports_missing_fields() {
    let state = memory_state().await;
    RecordBuilder::new("00000001", "IKE")
        .raw_fields(RawSourceFields::from_pairs([
            ("numero", text("1")),
            ("cliente", text("IKE")),
            ("fechaRegistro", text("2024-01-01")),
        ]))
        .order_line(order_line("0000000001", "10.00", OrderStatus::NotInvoiced))
        .insert(&state)
        .await;
    RecordBuilder::new("00000002", "IKE")
        .raw_fields(RawSourceFields::from_pairs([
            ("numero", text("2")),
            ("cliente", text("IKE")),
            ("fechaRegistro", RawValue::Null),
        ]))
        .invoice(invoice("F-1", "10.00"))
        .insert(&state)
        .await;

    let report = scan_client(&state.store, "ike", &state.config.required_raw_fields)
        .await
        .unwrap();

    assert_eq!(report.client_code, "IKE");
    assert_eq!(report.total_records, 2);
    assert_eq!(report.complete_records, 1);
    assert_eq!(report.with_orders, 1);
    assert_eq!(report.with_invoices, 1);
    assert_eq!(report.missing_by_field.get("fechaRegistro"), Some(&1));
    assert_eq!(report.incomplete.len(), 1);
    assert_eq!(report.incomplete[0].case_number, "00000002");
}

#[tokio::test]
async fn test_billing_reset_dry_run_then_reset() {
    let state = memory_state().await;
    let invoiced = RecordBuilder::new("00000001", "IKE")
        .invoice(invoice("F-1", "100.00"))
        .order_line(order_line("0000000001", "100.00", OrderStatus::Invoiced))
        .insert(&state)
        .await;
    RecordBuilder::new("00000002", "IKE").insert(&state).await;
    // Flag without evidence
    let stale = RecordBuilder::new("00000003", "IKE").insert(&state).await;

    state.orchestrator().run_consolidation("IKE").await.unwrap();
    state
        .store
        .find_one_and_update(
            &CaseFilter::by_id(stale),
            &CaseFieldSet {
                invoiced: Some(true),
                completion_state: Some(CompletionState::Partial),
                ..CaseFieldSet::default()
            },
            false,
        )
        .await
        .unwrap();

    let dry = state.billing_reset().reset(true).await.unwrap();
    assert!(dry.dry_run);
    assert_eq!(dry.total_records, 3);
    assert_eq!(dry.flagged_invoiced, 2);
    assert_eq!(dry.with_billing_evidence, 1);
    assert!(dry.inconsistent);
    assert_eq!(dry.reset, 0);
    assert!(record_by_id(&state, invoiced).await.reconciliation.invoiced);

    let done = state.billing_reset().reset(false).await.unwrap();
    assert_eq!(done.reset, 2);
    assert_eq!(done.flagged_after, 0);

    let record = record_by_id(&state, invoiced).await;
    assert!(!record.reconciliation.invoiced);
    assert_eq!(record.reconciliation.completion_state, CompletionState::Pending);
    // Billing evidence itself is untouched
    assert_eq!(record.invoices.len(), 1);
    assert_eq!(record.order_lines[0].status, OrderStatus::Invoiced);
}

#[tokio::test]
async fn test_ingest_batch_rejects_invalid_rows() {
    let state = memory_state().await;
    let rows = vec![
        IngestRow {
            fields: RawSourceFields::from_pairs([("numero", text("EXP-123")), ("cliente", text("ike"))]),
            ..IngestRow::default()
        },
        IngestRow {
            fields: RawSourceFields::from_pairs([("numero", text("")), ("cliente", text("IKE"))]),
            ..IngestRow::default()
        },
        IngestRow {
            fields: RawSourceFields::from_pairs([("numero", text("124")), ("cliente", text("IKE"))]),
            order_lines: vec![RawOrderLine {
                order_number: "55".to_string(),
                status: Some("cancelado".to_string()),
                ..RawOrderLine::default()
            }],
            ..IngestRow::default()
        },
    ];

    let report = state
        .ingest_admission()
        .ingest_batch(&rows, Some("concentrado"))
        .await
        .unwrap();

    assert_eq!(report.rows, 3);
    assert_eq!(report.admitted, 1);
    assert_eq!(report.rejected, 2);
    assert_eq!(report.invalid_keys, 1);
    assert_eq!(report.errors.len(), 2);

    let stored = state.store.find(&CaseFilter::all(), Default::default(), 0, None).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].key, BusinessKey::new("00000123", "IKE"));
    assert_eq!(stored[0].source.as_deref(), Some("concentrado"));
    assert_eq!(stored[0].raw_source_fields, rows[0].fields);
}

#[tokio::test]
async fn test_ingest_counts_rows_the_store_refuses() {
    let state = memory_state().await;
    refuse_inserts(&state, "00000124").await;
    let rows = vec![
        IngestRow {
            fields: RawSourceFields::from_pairs([("numero", text("123")), ("cliente", text("IKE"))]),
            ..IngestRow::default()
        },
        IngestRow {
            fields: RawSourceFields::from_pairs([("numero", text("124")), ("cliente", text("IKE"))]),
            ..IngestRow::default()
        },
        IngestRow {
            fields: RawSourceFields::from_pairs([("numero", text("125")), ("cliente", text("IKE"))]),
            ..IngestRow::default()
        },
    ];

    let report = state.ingest_admission().ingest_batch(&rows, None).await.unwrap();

    assert_eq!(report.admitted, 2);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.invalid_keys, 0);
    assert!(report.errors[0].starts_with("row 1:"));
    assert!(report.errors[0].contains("refused by the store"));
    assert_eq!(state.store.count(&CaseFilter::all()).await.unwrap(), 2);
}
