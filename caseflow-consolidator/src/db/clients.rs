//! Client registry

use caseflow_common::db::Client;
use caseflow_common::time::{now, to_storage};
use caseflow_common::{Error, Result};
use sqlx::SqlitePool;

/// Registered clients whose cases are consolidated
#[derive(Debug, Clone)]
pub struct ClientRegistry {
    pool: SqlitePool,
}

impl ClientRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Codes of every active client, sorted
    pub async fn active_clients(&self) -> Result<Vec<String>> {
        let codes: Vec<String> =
            sqlx::query_scalar("SELECT code FROM clients WHERE active = 1 ORDER BY code")
                .fetch_all(&self.pool)
                .await?;
        Ok(codes)
    }

    pub async fn get(&self, code: &str) -> Result<Option<Client>> {
        let row: Option<(String, String, bool)> =
            sqlx::query_as("SELECT code, name, active FROM clients WHERE code = ?")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(code, name, active)| Client { code, name, active }))
    }

    /// Insert or update a client
    ///
    /// The code must already be normalized.
    pub async fn register(&self, client: &Client) -> Result<()> {
        if client.code.is_empty() {
            return Err(Error::InvalidInput("client code must not be empty".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO clients (code, name, active, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(code) DO UPDATE SET name = excluded.name, active = excluded.active
            "#,
        )
        .bind(&client.code)
        .bind(&client.name)
        .bind(client.active)
        .bind(to_storage(&now()))
        .execute(&self.pool)
        .await?;

        tracing::info!(code = %client.code, active = client.active, "Registered client");
        Ok(())
    }
}
