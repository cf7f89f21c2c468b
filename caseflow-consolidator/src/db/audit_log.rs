//! Append-only audit log
//!
//! Appending never fails the caller: a failed insert is logged at WARN and
//! dropped.

use caseflow_common::time::{now, to_storage};
use caseflow_common::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    #[default]
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditLevel::Info => "INFO",
            AuditLevel::Warning => "WARNING",
            AuditLevel::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "WARNING" => AuditLevel::Warning,
            "ERROR" => AuditLevel::Error,
            _ => AuditLevel::Info,
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub client_code: String,
    pub level: AuditLevel,
    pub details: serde_json::Value,
}

impl AuditEntry {
    pub fn new(operation: &str, client_code: &str, details: serde_json::Value) -> Self {
        Self {
            timestamp: now(),
            operation: operation.to_string(),
            client_code: client_code.to_string(),
            level: AuditLevel::Info,
            details,
        }
    }

    pub fn with_level(mut self, level: AuditLevel) -> Self {
        self.level = level;
        self
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fire-and-forget append
    pub async fn append(&self, entry: AuditEntry) {
        if let Err(e) = self.try_append(&entry).await {
            tracing::warn!(
                operation = %entry.operation,
                client_code = %entry.client_code,
                error = %e,
                "Failed to write audit entry"
            );
        }
    }

    async fn try_append(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (timestamp, operation, client_code, level, details) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(to_storage(&entry.timestamp))
        .bind(&entry.operation)
        .bind(&entry.client_code)
        .bind(entry.level.as_str())
        .bind(serde_json::to_string(&entry.details)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent entries for a client, newest first
    pub async fn recent(&self, client_code: &str, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows: Vec<(String, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT timestamp, operation, client_code, level, details
            FROM audit_log
            WHERE client_code = ?
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(client_code)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for (timestamp, operation, client_code, level, details) in rows {
            entries.push(AuditEntry {
                timestamp: caseflow_common::time::from_storage(&timestamp).unwrap_or_default(),
                operation,
                client_code,
                level: AuditLevel::parse(&level),
                details: serde_json::from_str(&details)?,
            });
        }
        Ok(entries)
    }
}
