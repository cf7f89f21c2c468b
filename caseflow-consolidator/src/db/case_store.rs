//! Case record access
//!
//! Record-access contract used by every consolidation component:
//! `find`, `count`, `find_one_and_update`, `aggregate_group_by`, plus the
//! ingestion-side `insert` and the `distinct_service_types` / `update_many`
//! pair used by maintenance passes.
//!
//! Updates are field-level: only the columns named in a [`CaseFieldSet`] are
//! written, so order lines and invoices appended concurrently by other writers
//! are never clobbered. Raw source fields, order lines and invoices have no
//! member in [`CaseFieldSet`] and therefore cannot be changed through an update.

use caseflow_common::db::{
    BusinessKey, CaseRecord, Classification, CompletionState, DuplicateReason, NewCaseRecord,
    RawSourceFields, ReconciliationState, ServiceData,
};
use caseflow_common::time::{from_storage, to_storage};
use caseflow_common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

const RECORD_COLUMNS: &str = "id, case_number, client_code, source, service_type, service_date, \
     service_data, order_lines, invoices, raw_source_fields, last_updated, is_canonical, \
     is_duplicate, duplicate_reason, canonical_case_number, canonical_client_code, invoiced, \
     completion_state, last_consolidation_run";

/// Record selection
///
/// All present conditions must hold. The default filter matches every record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseFilter {
    pub id: Option<i64>,
    pub case_number: Option<String>,
    pub client_code: Option<String>,
    pub classification: Option<Classification>,
    pub invoiced: Option<bool>,
    pub has_invoices: Option<bool>,
    pub has_invoiced_order_lines: Option<bool>,
    /// `Some(None)` matches records without a service type
    pub service_type: Option<Option<String>>,
}

impl CaseFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    pub fn for_client(client_code: &str) -> Self {
        Self {
            client_code: Some(client_code.to_string()),
            ..Self::default()
        }
    }

    pub fn for_key(key: &BusinessKey) -> Self {
        Self {
            case_number: Some(key.case_number.clone()),
            client_code: Some(key.client_code.clone()),
            ..Self::default()
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_invoiced(mut self, invoiced: bool) -> Self {
        self.invoiced = Some(invoiced);
        self
    }

    pub fn with_has_invoices(mut self, has_invoices: bool) -> Self {
        self.has_invoices = Some(has_invoices);
        self
    }

    pub fn with_has_invoiced_order_lines(mut self, has_lines: bool) -> Self {
        self.has_invoiced_order_lines = Some(has_lines);
        self
    }

    pub fn with_service_type(mut self, service_type: Option<String>) -> Self {
        self.service_type = Some(service_type);
        self
    }

    fn push_where(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        qb.push(" WHERE 1 = 1");

        if let Some(id) = self.id {
            qb.push(" AND id = ").push_bind(id);
        }
        if let Some(case_number) = &self.case_number {
            qb.push(" AND case_number = ").push_bind(case_number.clone());
        }
        if let Some(client_code) = &self.client_code {
            qb.push(" AND client_code = ").push_bind(client_code.clone());
        }
        match self.classification {
            Some(Classification::Canonical) => {
                qb.push(" AND is_canonical = 1");
            }
            Some(Classification::Duplicate) => {
                qb.push(" AND is_canonical IS NOT 1 AND is_duplicate = 1");
            }
            Some(Classification::Unclassified) => {
                qb.push(" AND is_canonical IS NOT 1 AND is_duplicate IS NOT 1");
            }
            None => {}
        }
        if let Some(invoiced) = self.invoiced {
            qb.push(" AND invoiced = ").push_bind(invoiced);
        }
        match self.has_invoices {
            Some(true) => {
                qb.push(" AND json_array_length(invoices) > 0");
            }
            Some(false) => {
                qb.push(" AND json_array_length(invoices) = 0");
            }
            None => {}
        }
        if let Some(has_lines) = self.has_invoiced_order_lines {
            qb.push(if has_lines { " AND EXISTS" } else { " AND NOT EXISTS" });
            qb.push(
                " (SELECT 1 FROM json_each(case_records.order_lines) \
                 WHERE json_extract(value, '$.status') IN ('INVOICED', 'INVOICED_BY_CASE'))",
            );
        }
        match &self.service_type {
            Some(Some(service_type)) => {
                qb.push(" AND service_type = ").push_bind(service_type.clone());
            }
            Some(None) => {
                qb.push(" AND service_type IS NULL");
            }
            None => {}
        }
    }
}

/// One row read by [`CaseStore::find_decoded`]
#[derive(Debug)]
pub struct DecodedRow {
    pub id: i64,
    pub record: Result<CaseRecord>,
}

/// Result ordering for `find`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaseSort {
    /// Most recently updated first; records without a timestamp last; ties by id
    #[default]
    LastUpdatedDesc,
    /// Insertion order
    IdAsc,
}

impl CaseSort {
    fn sql(&self) -> &'static str {
        match self {
            CaseSort::LastUpdatedDesc => " ORDER BY last_updated IS NULL, last_updated DESC, id ASC",
            CaseSort::IdAsc => " ORDER BY id ASC",
        }
    }
}

/// Columns written by a field-level update
///
/// `None` leaves a column untouched. For nullable columns `Some(None)` writes
/// NULL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaseFieldSet {
    pub is_canonical: Option<bool>,
    pub is_duplicate: Option<bool>,
    pub duplicate_reason: Option<Option<DuplicateReason>>,
    pub canonical_reference: Option<Option<BusinessKey>>,
    pub invoiced: Option<bool>,
    pub completion_state: Option<CompletionState>,
    pub last_consolidation_run: Option<DateTime<Utc>>,
    pub service_type: Option<Option<String>>,
}

impl CaseFieldSet {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn push_assignments(&self, qb: &mut QueryBuilder<'_, Sqlite>) {
        let mut set = qb.separated(", ");

        if let Some(v) = self.is_canonical {
            set.push("is_canonical = ");
            set.push_bind_unseparated(v);
        }
        if let Some(v) = self.is_duplicate {
            set.push("is_duplicate = ");
            set.push_bind_unseparated(v);
        }
        if let Some(reason) = self.duplicate_reason {
            set.push("duplicate_reason = ");
            set.push_bind_unseparated(reason.map(|r| r.as_str()));
        }
        if let Some(reference) = &self.canonical_reference {
            set.push("canonical_case_number = ");
            set.push_bind_unseparated(reference.as_ref().map(|k| k.case_number.clone()));
            set.push("canonical_client_code = ");
            set.push_bind_unseparated(reference.as_ref().map(|k| k.client_code.clone()));
        }
        if let Some(v) = self.invoiced {
            set.push("invoiced = ");
            set.push_bind_unseparated(v);
        }
        if let Some(state) = self.completion_state {
            set.push("completion_state = ");
            set.push_bind_unseparated(state.as_str());
        }
        if let Some(ts) = &self.last_consolidation_run {
            set.push("last_consolidation_run = ");
            set.push_bind_unseparated(to_storage(ts));
        }
        if let Some(service_type) = &self.service_type {
            set.push("service_type = ");
            set.push_bind_unseparated(service_type.clone());
        }
    }
}

/// Grouping key for `aggregate_group_by`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKey {
    CaseNumber,
    BusinessKey,
    Classification,
}

impl GroupKey {
    fn columns(&self) -> &'static str {
        match self {
            GroupKey::CaseNumber => "case_number",
            GroupKey::BusinessKey => "case_number, client_code",
            GroupKey::Classification => "is_canonical, is_duplicate",
        }
    }
}

/// What each group accumulates besides its count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulators {
    /// Collect id, key and timestamp of every member
    pub collect_members: bool,
    /// Drop groups smaller than this
    pub min_count: i64,
}

impl Accumulators {
    pub fn count_only() -> Self {
        Self {
            collect_members: false,
            min_count: 1,
        }
    }

    pub fn members_of_groups_larger_than_one() -> Self {
        Self {
            collect_members: true,
            min_count: 2,
        }
    }
}

/// Value of the grouping key for one group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum GroupKeyValue {
    CaseNumber(String),
    BusinessKey(BusinessKey),
    Classification(Classification),
}

/// One group member
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub id: i64,
    pub key: BusinessKey,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One group produced by `aggregate_group_by`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    pub key: GroupKeyValue,
    pub count: i64,
    /// Empty unless members were requested
    pub members: Vec<GroupMember>,
}

/// Handle to the case record table
#[derive(Debug, Clone)]
pub struct CaseStore {
    pool: SqlitePool,
}

impl CaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a new record as supplied by an ingestion source
    ///
    /// Reconciliation fields start unset.
    pub async fn insert(&self, record: &NewCaseRecord) -> Result<i64> {
        let service_data = serde_json::to_string(&record.service_data.attributes)?;
        let order_lines = serde_json::to_string(&record.order_lines)?;
        let invoices = serde_json::to_string(&record.invoices)?;
        let raw_source_fields = serde_json::to_string(&record.raw_source_fields)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO case_records (
                case_number, client_code, source, service_type, service_date, service_data,
                order_lines, invoices, raw_source_fields, last_updated
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&record.case_number)
        .bind(&record.client_code)
        .bind(&record.source)
        .bind(&record.service_data.service_type)
        .bind(record.service_data.service_date.as_ref().map(to_storage))
        .bind(service_data)
        .bind(order_lines)
        .bind(invoices)
        .bind(raw_source_fields)
        .bind(record.last_updated.as_ref().map(to_storage))
        .fetch_one(&self.pool)
        .await?;

        tracing::debug!(
            id,
            case_number = %record.case_number,
            client_code = %record.client_code,
            "Inserted case record"
        );

        Ok(id)
    }

    /// Fetch records matching `filter` in `sort` order
    pub async fn find(
        &self,
        filter: &CaseFilter,
        sort: CaseSort,
        skip: i64,
        limit: Option<i64>,
    ) -> Result<Vec<CaseRecord>> {
        let rows = self.fetch_rows(filter, sort, skip, limit).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Like [`Self::find`], but decodes each row on its own
    ///
    /// The outer error is a failed query. A row whose stored columns cannot be
    /// decoded is returned with its error instead of failing the page.
    pub async fn find_decoded(
        &self,
        filter: &CaseFilter,
        sort: CaseSort,
        skip: i64,
        limit: Option<i64>,
    ) -> Result<Vec<DecodedRow>> {
        let rows = self.fetch_rows(filter, sort, skip, limit).await?;
        rows.iter()
            .map(|row| {
                Ok(DecodedRow {
                    id: row.try_get("id")?,
                    record: record_from_row(row),
                })
            })
            .collect()
    }

    async fn fetch_rows(
        &self,
        filter: &CaseFilter,
        sort: CaseSort,
        skip: i64,
        limit: Option<i64>,
    ) -> Result<Vec<SqliteRow>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {} FROM case_records", RECORD_COLUMNS));
        filter.push_where(&mut qb);
        qb.push(sort.sql());
        // SQLite needs a LIMIT for OFFSET; -1 means unbounded
        qb.push(" LIMIT ").push_bind(limit.unwrap_or(-1));
        qb.push(" OFFSET ").push_bind(skip.max(0));

        Ok(qb.build().fetch_all(&self.pool).await?)
    }

    /// First record matching `filter` in insertion order
    pub async fn find_one(&self, filter: &CaseFilter) -> Result<Option<CaseRecord>> {
        Ok(self
            .find(filter, CaseSort::IdAsc, 0, Some(1))
            .await?
            .into_iter()
            .next())
    }

    pub async fn count(&self, filter: &CaseFilter) -> Result<i64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM case_records");
        filter.push_where(&mut qb);
        let count: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Apply `fields` to the first record matching `filter` and return it
    ///
    /// Returns `Ok(None)` when nothing matches and `upsert` is false. With
    /// `upsert`, a missing record is created from the filter's case number and
    /// client code (both required) before the fields are applied.
    pub async fn find_one_and_update(
        &self,
        filter: &CaseFilter,
        fields: &CaseFieldSet,
        upsert: bool,
    ) -> Result<Option<CaseRecord>> {
        if fields.is_empty() {
            let found = self.find_one(filter).await?;
            if found.is_some() || !upsert {
                return Ok(found);
            }
        } else if let Some(updated) = self.update_first(filter, fields).await? {
            return Ok(Some(updated));
        }

        if !upsert {
            return Ok(None);
        }

        let (Some(case_number), Some(client_code)) = (&filter.case_number, &filter.client_code) else {
            return Err(Error::InvalidInput(
                "upsert requires case number and client code in the filter".to_string(),
            ));
        };

        let id = self
            .insert(&NewCaseRecord {
                case_number: case_number.clone(),
                client_code: client_code.clone(),
                last_updated: Some(caseflow_common::time::now()),
                ..NewCaseRecord::default()
            })
            .await?;

        if fields.is_empty() {
            return self.find_one(&CaseFilter::by_id(id)).await;
        }
        self.update_first(&CaseFilter::by_id(id), fields).await
    }

    async fn update_first(&self, filter: &CaseFilter, fields: &CaseFieldSet) -> Result<Option<CaseRecord>> {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE case_records SET ");
        fields.push_assignments(&mut qb);
        qb.push(" WHERE id = (SELECT id FROM case_records");
        filter.push_where(&mut qb);
        qb.push(" ORDER BY id LIMIT 1) RETURNING ");
        qb.push(RECORD_COLUMNS);

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Apply `fields` to every record matching `filter`; returns rows changed
    pub async fn update_many(&self, filter: &CaseFilter, fields: &CaseFieldSet) -> Result<u64> {
        if fields.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE case_records SET ");
        fields.push_assignments(&mut qb);
        filter.push_where(&mut qb);

        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Rewrite the cached service type mirror from `from` to `to`
    pub async fn update_service_type(&self, filter: &CaseFilter, from: &str, to: &str) -> Result<u64> {
        let filter = filter.clone().with_service_type(Some(from.to_string()));
        let fields = CaseFieldSet {
            service_type: Some(Some(to.to_string())),
            ..CaseFieldSet::default()
        };
        self.update_many(&filter, &fields).await
    }

    /// Distinct non-null service types among matching records
    pub async fn distinct_service_types(&self, filter: &CaseFilter) -> Result<Vec<String>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT DISTINCT service_type FROM case_records");
        filter.push_where(&mut qb);
        qb.push(" AND service_type IS NOT NULL ORDER BY service_type");

        let values: Vec<String> = qb.build_query_scalar().fetch_all(&self.pool).await?;
        Ok(values)
    }

    /// Group matching records by `group_key`
    ///
    /// Groups are returned largest first, then by key. Flag pairs that map to
    /// the same [`Classification`] are merged into one group.
    pub async fn aggregate_group_by(
        &self,
        filter: &CaseFilter,
        group_key: GroupKey,
        accumulators: Accumulators,
    ) -> Result<Vec<GroupSummary>> {
        let mut groups: Vec<GroupSummary> = Vec::new();
        let mut index: HashMap<GroupKeyValue, usize> = HashMap::new();

        if accumulators.collect_members {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT id, case_number, client_code, last_updated, is_canonical, is_duplicate FROM case_records",
            );
            filter.push_where(&mut qb);
            qb.push(" ORDER BY ");
            qb.push(group_key.columns());
            qb.push(", id");

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                let member = GroupMember {
                    id: row.try_get("id")?,
                    key: BusinessKey::new(
                        row.try_get::<String, _>("case_number")?,
                        row.try_get::<String, _>("client_code")?,
                    ),
                    last_updated: parse_optional_timestamp(row.try_get("last_updated")?),
                };
                let key = group_key_value(group_key, row, &member.key)?;
                let slot = *index.entry(key.clone()).or_insert_with(|| {
                    groups.push(GroupSummary {
                        key,
                        count: 0,
                        members: Vec::new(),
                    });
                    groups.len() - 1
                });
                groups[slot].count += 1;
                groups[slot].members.push(member);
            }
        } else {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {}, COUNT(*) AS group_count FROM case_records",
                group_key.columns()
            ));
            filter.push_where(&mut qb);
            qb.push(" GROUP BY ");
            qb.push(group_key.columns());

            let rows = qb.build().fetch_all(&self.pool).await?;
            for row in &rows {
                let key = match group_key {
                    GroupKey::Classification => GroupKeyValue::Classification(Classification::from_flags(
                        row.try_get("is_canonical")?,
                        row.try_get("is_duplicate")?,
                    )),
                    GroupKey::CaseNumber => GroupKeyValue::CaseNumber(row.try_get("case_number")?),
                    GroupKey::BusinessKey => GroupKeyValue::BusinessKey(BusinessKey::new(
                        row.try_get::<String, _>("case_number")?,
                        row.try_get::<String, _>("client_code")?,
                    )),
                };
                let count: i64 = row.try_get("group_count")?;
                let slot = *index.entry(key.clone()).or_insert_with(|| {
                    groups.push(GroupSummary {
                        key,
                        count: 0,
                        members: Vec::new(),
                    });
                    groups.len() - 1
                });
                groups[slot].count += count;
            }
        }

        groups.retain(|g| g.count >= accumulators.min_count);
        groups.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.key.cmp(&b.key)));

        Ok(groups)
    }
}

fn group_key_value(group_key: GroupKey, row: &SqliteRow, key: &BusinessKey) -> Result<GroupKeyValue> {
    Ok(match group_key {
        GroupKey::CaseNumber => GroupKeyValue::CaseNumber(key.case_number.clone()),
        GroupKey::BusinessKey => GroupKeyValue::BusinessKey(key.clone()),
        GroupKey::Classification => GroupKeyValue::Classification(Classification::from_flags(
            row.try_get("is_canonical")?,
            row.try_get("is_duplicate")?,
        )),
    })
}

fn parse_optional_timestamp(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(from_storage)
}

fn record_from_row(row: &SqliteRow) -> Result<CaseRecord> {
    let id: i64 = row.try_get("id")?;

    let service_attributes: String = row.try_get("service_data")?;
    let order_lines: String = row.try_get("order_lines")?;
    let invoices: String = row.try_get("invoices")?;
    let raw_source_fields: String = row.try_get("raw_source_fields")?;

    let duplicate_reason = match row.try_get::<Option<String>, _>("duplicate_reason")? {
        Some(raw) => Some(DuplicateReason::parse(&raw).ok_or_else(|| {
            Error::InvalidInput(format!("record {}: unknown duplicate reason '{}'", id, raw))
        })?),
        None => None,
    };

    let completion_raw: String = row.try_get("completion_state")?;
    let completion_state = CompletionState::parse(&completion_raw).ok_or_else(|| {
        Error::InvalidInput(format!("record {}: unknown completion state '{}'", id, completion_raw))
    })?;

    let canonical_reference = match (
        row.try_get::<Option<String>, _>("canonical_case_number")?,
        row.try_get::<Option<String>, _>("canonical_client_code")?,
    ) {
        (Some(case_number), Some(client_code)) => Some(BusinessKey::new(case_number, client_code)),
        _ => None,
    };

    Ok(CaseRecord {
        id,
        key: BusinessKey::new(
            row.try_get::<String, _>("case_number")?,
            row.try_get::<String, _>("client_code")?,
        ),
        source: row.try_get("source")?,
        service_data: ServiceData {
            service_type: row.try_get("service_type")?,
            service_date: parse_optional_timestamp(row.try_get("service_date")?),
            attributes: serde_json::from_str(&service_attributes)?,
        },
        order_lines: serde_json::from_str(&order_lines)?,
        invoices: serde_json::from_str(&invoices)?,
        reconciliation: ReconciliationState {
            last_updated: parse_optional_timestamp(row.try_get("last_updated")?),
            is_canonical: row.try_get("is_canonical")?,
            is_duplicate: row.try_get("is_duplicate")?,
            duplicate_reason,
            canonical_reference,
            invoiced: row.try_get("invoiced")?,
            completion_state,
            last_consolidation_run: parse_optional_timestamp(row.try_get("last_consolidation_run")?),
        },
        raw_source_fields: serde_json::from_str::<RawSourceFields>(&raw_source_fields)?,
    })
}
