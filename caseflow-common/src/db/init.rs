//! Database initialization
//!
//! Opens (creating if needed) the SQLite database and creates the Caseflow
//! tables idempotently. Safe to call on every startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path, busy_timeout_ms: u64) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows readers (query API, dashboards) alongside a consolidation run
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;

    let pragma_sql = format!("PRAGMA busy_timeout = {}", busy_timeout_ms);
    sqlx::query(&pragma_sql).execute(&pool).await?;
    info!("Database busy timeout set to {} ms", busy_timeout_ms);

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create every Caseflow table and index (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_case_records_table(pool).await?;
    create_clients_table(pool).await?;
    create_audit_log_table(pool).await?;
    Ok(())
}

/// Case records
///
/// `is_canonical`/`is_duplicate` are nullable: NULL in both marks a record
/// that has never been reconciled. JSON columns hold the ordered lists and
/// the raw source map.
pub async fn create_case_records_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS case_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            case_number TEXT NOT NULL,
            client_code TEXT NOT NULL,
            source TEXT,
            service_type TEXT,
            service_date TEXT,
            service_data TEXT NOT NULL DEFAULT '{}',
            order_lines TEXT NOT NULL DEFAULT '[]',
            invoices TEXT NOT NULL DEFAULT '[]',
            raw_source_fields TEXT NOT NULL DEFAULT '[]',
            last_updated TEXT,
            is_canonical INTEGER,
            is_duplicate INTEGER,
            duplicate_reason TEXT,
            canonical_case_number TEXT,
            canonical_client_code TEXT,
            invoiced INTEGER NOT NULL DEFAULT 0,
            completion_state TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (completion_state IN ('PENDING', 'PARTIAL', 'COMPLETE')),
            last_consolidation_run TEXT,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            CHECK (completion_state != 'COMPLETE' OR invoiced = 1)
        )
        "#,
    )
    .execute(pool)
    .await?;

    for index_sql in [
        "CREATE INDEX IF NOT EXISTS idx_case_records_key ON case_records(case_number, client_code)",
        "CREATE INDEX IF NOT EXISTS idx_case_records_client_updated ON case_records(client_code, last_updated DESC)",
        "CREATE INDEX IF NOT EXISTS idx_case_records_flags ON case_records(is_canonical, is_duplicate)",
        "CREATE INDEX IF NOT EXISTS idx_case_records_service_type ON case_records(service_type)",
    ] {
        sqlx::query(index_sql).execute(pool).await?;
    }

    Ok(())
}

/// Client registry
pub async fn create_clients_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS clients (
            code TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only audit log
pub async fn create_audit_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp TEXT NOT NULL,
            operation TEXT NOT NULL,
            client_code TEXT NOT NULL,
            level TEXT NOT NULL DEFAULT 'INFO'
                CHECK (level IN ('INFO', 'WARNING', 'ERROR')),
            details TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_log_client_time ON audit_log(client_code, timestamp DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
