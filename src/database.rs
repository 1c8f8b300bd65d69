/// SQLite pool bootstrap and schema
///
/// One database file holds both the published flows and the automation
/// instances. The schema is created idempotently at startup.

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;

/// Open (creating if missing) the engine database under `data_dir`
pub async fn open_pool(data_dir: &str) -> Result<SqlitePool> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create data directory '{}': {}", data_dir, e))?;
    let db_path = Path::new(data_dir).join("automation.db");

    tracing::info!("🗄️ Opening automation database: {}", db_path.display());

    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;

    init_schema(&pool).await?;

    tracing::info!("✅ Automation database ready: {}", db_path.display());
    Ok(pool)
}

/// Single-connection in-memory database, used by tests and dry runs
///
/// An in-memory SQLite database lives inside one connection, so the pool is
/// capped at one connection that never expires.
pub async fn open_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await?;

    init_schema(&pool).await?;
    Ok(pool)
}

/// Create tables and indexes (safe to call repeatedly)
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS flows (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            trigger_kind TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            definition TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_flows_trigger_kind ON flows(trigger_kind)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS automation_instances (
            id TEXT PRIMARY KEY,
            flow_id TEXT NOT NULL,
            conversation_id TEXT NOT NULL,
            current_node_id TEXT NOT NULL,
            state TEXT NOT NULL,
            deadline_ms INTEGER,
            context TEXT NOT NULL,
            execution_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            step_seq INTEGER NOT NULL DEFAULT 0,
            seen_messages TEXT NOT NULL,
            version INTEGER NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one live instance per flow and conversation
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_instances_one_active
        ON automation_instances(flow_id, conversation_id)
        WHERE state IN ('running', 'waiting_for_reply', 'waiting_for_timer')
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_instances_conversation ON automation_instances(conversation_id, state)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_instances_deadline ON automation_instances(state, deadline_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
