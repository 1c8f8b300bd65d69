/// Durable instance store
///
/// All mutations are whole-record writes guarded by an optimistic version
/// check, so a saved instance is always internally consistent and a crash
/// can only lose the transition that was in flight.

use crate::error::StoreError;
use crate::instance::types::{AutomationInstance, InstanceState};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{
    sqlite::{SqlitePool, SqliteRow},
    Row,
};

const ACTIVE_STATES: &str = "('running', 'waiting_for_reply', 'waiting_for_timer')";

const SELECT_COLUMNS: &str = "SELECT id, flow_id, conversation_id, current_node_id, state, deadline_ms, \
     context, execution_count, last_error, step_seq, seen_messages, version, created_at, updated_at \
     FROM automation_instances";

/// Persistence contract the engine, timers and dispatcher rely on
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert a new instance; rejects a second live instance per flow and conversation
    async fn create(&self, instance: &AutomationInstance) -> Result<AutomationInstance, StoreError>;

    async fn load(&self, id: &str) -> Result<Option<AutomationInstance>, StoreError>;

    /// Replace the record if its stored version still equals `expected_version`
    ///
    /// Returns the new version. A mismatch yields `StoreError::Conflict`.
    async fn save(&self, instance: &AutomationInstance, expected_version: i64) -> Result<i64, StoreError>;

    /// Waiting instances whose deadline is at or before `now`
    async fn find_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<AutomationInstance>, StoreError>;

    /// Instances of a conversation parked on a reply window or a time gap
    async fn find_waiting_by_conversation(&self, conversation_id: &str) -> Result<Vec<AutomationInstance>, StoreError>;

    async fn find_active_by_conversation(&self, conversation_id: &str) -> Result<Vec<AutomationInstance>, StoreError>;

    async fn find_active_by_flow(&self, flow_id: &str) -> Result<Vec<AutomationInstance>, StoreError>;

    async fn find_active(&self, flow_id: &str, conversation_id: &str) -> Result<Option<AutomationInstance>, StoreError>;

    /// Instances left mid-step (only possible after a crash)
    async fn find_running(&self) -> Result<Vec<AutomationInstance>, StoreError>;

    /// Every instance of a conversation, newest first (audit view)
    async fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<AutomationInstance>, StoreError>;
}

/// SQLite implementation of [`InstanceStore`]
#[derive(Debug, Clone)]
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_many(&self, sql: &str, binds: &[&str]) -> Result<Vec<AutomationInstance>, StoreError> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(instance_from_row).collect()
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn create(&self, instance: &AutomationInstance) -> Result<AutomationInstance, StoreError> {
        let mut created = instance.clone();
        created.version = 1;
        created.updated_at = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO automation_instances
                (id, flow_id, conversation_id, current_node_id, state, deadline_ms, context,
                 execution_count, last_error, step_seq, seen_messages, version, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&created.id)
        .bind(&created.flow_id)
        .bind(&created.conversation_id)
        .bind(&created.current_node_id)
        .bind(created.state.as_str())
        .bind(created.deadline.map(|d| d.timestamp_millis()))
        .bind(serde_json::to_string(&created.context)?)
        .bind(created.execution_count)
        .bind(&created.last_error)
        .bind(created.step_seq)
        .bind(serde_json::to_string(&created.seen_messages)?)
        .bind(created.version)
        .bind(created.created_at.to_rfc3339())
        .bind(created.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(created),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(StoreError::ActiveInstanceExists {
                flow_id: created.flow_id,
                conversation_id: created.conversation_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, id: &str) -> Result<Option<AutomationInstance>, StoreError> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(instance_from_row).transpose()
    }

    async fn save(&self, instance: &AutomationInstance, expected_version: i64) -> Result<i64, StoreError> {
        let new_version = expected_version + 1;

        let result = sqlx::query(
            r#"
            UPDATE automation_instances SET
                current_node_id = ?,
                state = ?,
                deadline_ms = ?,
                context = ?,
                execution_count = ?,
                last_error = ?,
                step_seq = ?,
                seen_messages = ?,
                version = ?,
                updated_at = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(&instance.current_node_id)
        .bind(instance.state.as_str())
        .bind(instance.deadline.map(|d| d.timestamp_millis()))
        .bind(serde_json::to_string(&instance.context)?)
        .bind(instance.execution_count)
        .bind(&instance.last_error)
        .bind(instance.step_seq)
        .bind(serde_json::to_string(&instance.seen_messages)?)
        .bind(new_version)
        .bind(Utc::now().to_rfc3339())
        .bind(&instance.id)
        .bind(expected_version)
        .execute(&self.pool)
        .await;

        let result = match result {
            Ok(r) => r,
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(StoreError::ActiveInstanceExists {
                    flow_id: instance.flow_id.clone(),
                    conversation_id: instance.conversation_id.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM automation_instances WHERE id = ?")
                .bind(&instance.id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();

            return Err(if exists {
                StoreError::Conflict {
                    id: instance.id.clone(),
                    expected: expected_version,
                }
            } else {
                StoreError::NotFound(instance.id.clone())
            });
        }

        Ok(new_version)
    }

    async fn find_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<AutomationInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "{} WHERE state IN ('waiting_for_reply', 'waiting_for_timer') \
             AND deadline_ms IS NOT NULL AND deadline_ms <= ? ORDER BY deadline_ms",
            SELECT_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(instance_from_row).collect()
    }

    async fn find_waiting_by_conversation(&self, conversation_id: &str) -> Result<Vec<AutomationInstance>, StoreError> {
        self.fetch_many(
            &format!(
                "{} WHERE conversation_id = ? AND state IN ('waiting_for_reply', 'waiting_for_timer') ORDER BY created_at",
                SELECT_COLUMNS
            ),
            &[conversation_id],
        )
        .await
    }

    async fn find_active_by_conversation(&self, conversation_id: &str) -> Result<Vec<AutomationInstance>, StoreError> {
        self.fetch_many(
            &format!(
                "{} WHERE conversation_id = ? AND state IN {} ORDER BY created_at",
                SELECT_COLUMNS, ACTIVE_STATES
            ),
            &[conversation_id],
        )
        .await
    }

    async fn find_active_by_flow(&self, flow_id: &str) -> Result<Vec<AutomationInstance>, StoreError> {
        self.fetch_many(
            &format!("{} WHERE flow_id = ? AND state IN {}", SELECT_COLUMNS, ACTIVE_STATES),
            &[flow_id],
        )
        .await
    }

    async fn find_active(&self, flow_id: &str, conversation_id: &str) -> Result<Option<AutomationInstance>, StoreError> {
        let found = self
            .fetch_many(
                &format!(
                    "{} WHERE flow_id = ? AND conversation_id = ? AND state IN {}",
                    SELECT_COLUMNS, ACTIVE_STATES
                ),
                &[flow_id, conversation_id],
            )
            .await?;
        Ok(found.into_iter().next())
    }

    async fn find_running(&self) -> Result<Vec<AutomationInstance>, StoreError> {
        self.fetch_many(&format!("{} WHERE state = 'running'", SELECT_COLUMNS), &[])
            .await
    }

    async fn list_by_conversation(&self, conversation_id: &str) -> Result<Vec<AutomationInstance>, StoreError> {
        self.fetch_many(
            &format!("{} WHERE conversation_id = ? ORDER BY created_at DESC", SELECT_COLUMNS),
            &[conversation_id],
        )
        .await
    }
}

fn instance_from_row(row: &SqliteRow) -> Result<AutomationInstance, StoreError> {
    let state: String = row.try_get("state")?;
    let state = InstanceState::parse(&state).ok_or_else(|| {
        StoreError::Database(sqlx::Error::Decode(
            format!("unknown instance state '{}'", state).into(),
        ))
    })?;

    let deadline_ms: Option<i64> = row.try_get("deadline_ms")?;
    let context: String = row.try_get("context")?;
    let seen_messages: String = row.try_get("seen_messages")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(AutomationInstance {
        id: row.try_get("id")?,
        flow_id: row.try_get("flow_id")?,
        conversation_id: row.try_get("conversation_id")?,
        current_node_id: row.try_get("current_node_id")?,
        state,
        deadline: deadline_ms.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        context: serde_json::from_str(&context)?,
        execution_count: row.try_get("execution_count")?,
        last_error: row.try_get("last_error")?,
        step_seq: row.try_get("step_seq")?,
        seen_messages: serde_json::from_str(&seen_messages)?,
        version: row.try_get("version")?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
