/// SQLite persistence for flow definitions
///
/// Flows are owned by the builder; the engine only needs them durable so the
/// registry can be rebuilt after a restart. Definitions are stored as JSON with
/// a few indexed columns for lookups.

use crate::flow::types::FlowDefinition;
use anyhow::Result;
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::HashMap;

/// SQLite-backed flow storage
#[derive(Debug, Clone)]
pub struct FlowStorage {
    pool: SqlitePool,
}

impl FlowStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a new flow or replace an existing one
    pub async fn save_flow(&self, flow: &FlowDefinition) -> Result<()> {
        let definition_json = serde_json::to_string(flow)?;

        sqlx::query(
            r#"
            INSERT INTO flows (id, name, trigger_kind, version, definition, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                trigger_kind = excluded.trigger_kind,
                version = excluded.version,
                definition = excluded.definition,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&flow.id)
        .bind(&flow.name)
        .bind(flow.trigger_kind.as_str())
        .bind(flow.version)
        .bind(&definition_json)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_flow(&self, id: &str) -> Result<Option<FlowDefinition>> {
        let row = sqlx::query("SELECT definition FROM flows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let definition_json: String = row.get("definition");
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    /// List flows with basic metadata, most recently updated first
    pub async fn list_flows(&self) -> Result<Vec<FlowMetadata>> {
        let rows = sqlx::query(
            "SELECT id, name, trigger_kind, version, updated_at FROM flows ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| FlowMetadata {
                id: row.get("id"),
                name: row.get("name"),
                trigger_kind: row.get("trigger_kind"),
                version: row.get("version"),
                updated_at: row.get("updated_at"),
            })
            .collect())
    }

    /// Load every stored flow keyed by id (registry bootstrap)
    ///
    /// Rows that no longer parse are skipped with a warning instead of
    /// preventing startup.
    pub async fn load_all_flows(&self) -> Result<HashMap<String, FlowDefinition>> {
        let rows = sqlx::query("SELECT id, definition FROM flows")
            .fetch_all(&self.pool)
            .await?;

        let mut flows = HashMap::new();
        for row in rows {
            let id: String = row.get("id");
            let definition_json: String = row.get("definition");
            match serde_json::from_str::<FlowDefinition>(&definition_json) {
                Ok(flow) => {
                    flows.insert(id, flow);
                }
                Err(e) => tracing::warn!("⚠️ Skipping unreadable flow '{}': {}", id, e),
            }
        }

        Ok(flows)
    }

    pub async fn delete_flow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM flows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Flow summary for listing endpoints
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowMetadata {
    pub id: String,
    pub name: String,
    pub trigger_kind: String,
    pub version: i64,
    pub updated_at: String,
}
