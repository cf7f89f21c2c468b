//! Duplicate resolution
//!
//! Picks exactly one canonical record per business key and classifies the
//! rest as prior versions.
//!
//! **In-memory mode** walks a projected batch once, keeping the current winner
//! per key. On a collision the record with the later most-recent timestamp
//! wins; a present timestamp beats an absent one; on a tie the record seen
//! later wins. The result is deterministic for a fixed input order but depends
//! on that order when timestamps tie.
//!
//! **In-store mode** repairs persisted groups: members are ranked by last
//! update (missing last, ties by lowest id), the first becomes canonical and
//! each group is written independently.

use crate::db::{Accumulators, AuditEntry, AuditLevel, AuditLog, CaseFieldSet, CaseFilter, CaseStore, GroupKey, GroupMember};
use crate::error::{ConsolidationError, Result};
use crate::services::normalizer::{normalize_case_key, normalize_client_code};
use crate::services::record_projector::ProjectedRecord;
use caseflow_common::config::DedupScope;
use caseflow_common::db::{BusinessKey, DuplicateReason};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// A record classified as a duplicate
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateRecord {
    pub projected: ProjectedRecord,
    pub reason: DuplicateReason,
    pub canonical_reference: BusinessKey,
    /// Store id of the record that won the key
    pub canonical_id: i64,
}

/// A record that won its key
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    /// Normalized business key
    pub key: BusinessKey,
    pub projected: ProjectedRecord,
}

/// Outcome of an in-memory pass
#[derive(Debug, Default)]
pub struct Resolution {
    /// In order of first appearance of each key
    pub canonical_records: Vec<CanonicalRecord>,
    pub duplicates: Vec<DuplicateRecord>,
    /// Records skipped because their stored key does not normalize
    pub invalid_keys: Vec<ConsolidationError>,
    pub total_processed: usize,
}

/// Outcome of an in-store repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub scope: DedupScope,
    /// Groups with more than one member
    pub groups: usize,
    pub duplicates_marked: usize,
    pub records_updated: usize,
    pub failed_groups: usize,
}

/// True when `candidate` displaces `current` as the winner of a key
fn supersedes(candidate: &ProjectedRecord, current: &ProjectedRecord) -> bool {
    // None < Some, and equality goes to the later record
    candidate.most_recent_timestamp >= current.most_recent_timestamp
}

/// Normalized business key of a stored record
pub fn normalized_key(key: &BusinessKey) -> std::result::Result<BusinessKey, ConsolidationError> {
    let case_number = normalize_case_key(&key.case_number);
    let client_code = normalize_client_code(&key.client_code);
    if case_number.is_empty() || client_code.is_empty() {
        return Err(ConsolidationError::InvalidKey {
            raw_case_number: key.case_number.clone(),
            raw_client_code: key.client_code.clone(),
        });
    }
    Ok(BusinessKey::new(case_number, client_code))
}

/// Resolve a projected batch in a single pass
pub fn resolve_in_memory<I>(records: I) -> Resolution
where
    I: IntoIterator<Item = ProjectedRecord>,
{
    let mut resolution = Resolution::default();
    let mut slots: HashMap<BusinessKey, usize> = HashMap::new();
    let mut displaced: Vec<(BusinessKey, ProjectedRecord)> = Vec::new();

    for projected in records {
        resolution.total_processed += 1;

        let key = match normalized_key(&projected.record.key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(record_id = projected.record.id, error = %e, "Skipping record");
                resolution.invalid_keys.push(e);
                continue;
            }
        };

        match slots.get(&key) {
            None => {
                slots.insert(key.clone(), resolution.canonical_records.len());
                resolution.canonical_records.push(CanonicalRecord { key, projected });
            }
            Some(&slot) => {
                let current = &mut resolution.canonical_records[slot].projected;
                if supersedes(&projected, current) {
                    tracing::debug!(
                        key = %key,
                        winner = projected.record.id,
                        displaced = current.record.id,
                        "Newer version displaces current canonical"
                    );
                    let previous = std::mem::replace(current, projected);
                    displaced.push((key, previous));
                } else {
                    tracing::debug!(key = %key, record_id = projected.record.id, "Prior version");
                    displaced.push((key, projected));
                }
            }
        }
    }

    for (key, projected) in displaced {
        let canonical_id = slots
            .get(&key)
            .map(|&slot| resolution.canonical_records[slot].projected.record.id)
            .unwrap_or_default();
        resolution.duplicates.push(DuplicateRecord {
            projected,
            reason: DuplicateReason::PriorVersion,
            canonical_reference: key,
            canonical_id,
        });
    }

    resolution
}

/// Rank group members: most recent first, missing timestamps last, then id
fn rank_members(members: &mut [GroupMember]) {
    members.sort_by(|a, b| match (a.last_updated, b.last_updated) {
        (Some(x), Some(y)) => y.cmp(&x).then(a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.id.cmp(&b.id),
    });
}

fn canonical_fields() -> CaseFieldSet {
    CaseFieldSet {
        is_canonical: Some(true),
        is_duplicate: Some(false),
        duplicate_reason: Some(None),
        canonical_reference: Some(None),
        ..CaseFieldSet::default()
    }
}

fn duplicate_fields(reference: &BusinessKey) -> CaseFieldSet {
    CaseFieldSet {
        is_canonical: Some(false),
        is_duplicate: Some(true),
        duplicate_reason: Some(Some(DuplicateReason::PriorVersion)),
        canonical_reference: Some(Some(reference.clone())),
        ..CaseFieldSet::default()
    }
}

/// Repair pass over persisted duplicate groups
#[derive(Debug, Clone)]
pub struct StoreDuplicateRepair {
    store: CaseStore,
    audit: AuditLog,
}

impl StoreDuplicateRepair {
    pub fn new(store: CaseStore, audit: AuditLog) -> Self {
        Self { store, audit }
    }

    /// Classify every persisted group larger than one
    ///
    /// `client_code` restricts the pass to one client; `None` covers the
    /// whole store. A rejected write fails only its group; a store failure
    /// stops the pass, keeping the groups already written.
    pub async fn repair(&self, scope: DedupScope, client_code: Option<&str>) -> Result<RepairReport> {
        let filter = match client_code {
            Some(code) => CaseFilter::for_client(&normalize_client_code(code)),
            None => CaseFilter::all(),
        };
        let group_key = match scope {
            DedupScope::PerClient => GroupKey::BusinessKey,
            DedupScope::Global => GroupKey::CaseNumber,
        };

        let groups = self
            .store
            .aggregate_group_by(&filter, group_key, Accumulators::members_of_groups_larger_than_one())
            .await?;

        let mut report = RepairReport {
            scope,
            groups: groups.len(),
            ..RepairReport::default()
        };

        tracing::info!(scope = %scope, groups = report.groups, "Repairing duplicate groups");

        for group in groups {
            let mut members = group.members;
            rank_members(&mut members);
            let Some((winner, rest)) = members.split_first() else {
                continue;
            };

            match self.write_group(winner, rest).await {
                Ok(updated) => {
                    report.records_updated += updated;
                    report.duplicates_marked += rest.len();
                }
                Err(e) if e.is_store_failure() => {
                    tracing::error!(
                        group = ?group.key,
                        repaired = report.records_updated,
                        error = %e,
                        "Store failed during duplicate repair"
                    );
                    return Err(ConsolidationError::StoreUnavailable(e));
                }
                Err(e) => {
                    tracing::warn!(group = ?group.key, error = %e, "Failed to repair duplicate group");
                    report.failed_groups += 1;
                }
            }
        }

        let level = if report.failed_groups > 0 {
            AuditLevel::Warning
        } else {
            AuditLevel::Info
        };
        self.audit
            .append(
                AuditEntry::new(
                    "repair_duplicates",
                    client_code.map(normalize_client_code).as_deref().unwrap_or("ALL"),
                    serde_json::to_value(&report).unwrap_or_default(),
                )
                .with_level(level),
            )
            .await;

        tracing::info!(
            groups = report.groups,
            duplicates_marked = report.duplicates_marked,
            records_updated = report.records_updated,
            failed_groups = report.failed_groups,
            "Duplicate repair complete"
        );

        Ok(report)
    }

    async fn write_group(&self, winner: &GroupMember, rest: &[GroupMember]) -> caseflow_common::Result<usize> {
        let mut updated = 0;

        if self
            .store
            .find_one_and_update(&CaseFilter::by_id(winner.id), &canonical_fields(), false)
            .await?
            .is_some()
        {
            updated += 1;
        }

        let fields = duplicate_fields(&winner.key);
        for member in rest {
            if self
                .store
                .find_one_and_update(&CaseFilter::by_id(member.id), &fields, false)
                .await?
                .is_some()
            {
                updated += 1;
            }
        }

        Ok(updated)
    }
}
