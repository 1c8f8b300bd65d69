/// Typed error taxonomy for the automation engine
///
/// Storage, delivery and engine failures are kept apart so the engine can decide
/// which ones are terminal for an instance and which ones are retried locally.
/// HTTP glue and startup wiring keep using `anyhow`.

use thiserror::Error;

/// Failures raised by the instance store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-lock mismatch: somebody saved the instance since it was loaded
    #[error("version conflict on instance '{id}' (expected version {expected})")]
    Conflict { id: String, expected: i64 },

    /// A non-terminal instance already exists for this flow and conversation
    #[error("flow '{flow_id}' already has an active instance for conversation '{conversation_id}'")]
    ActiveInstanceExists {
        flow_id: String,
        conversation_id: String,
    },

    #[error("instance '{0}' not found")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt instance record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures reported by an action executor
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// Channel-side hiccup (rate limit, timeout, 5xx); worth retrying
    #[error("transient delivery failure: {0}")]
    Transient(String),

    /// The action can never succeed as configured (unknown template, bad recipient)
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

/// Failures of the timer subsystem
#[derive(Debug, Error)]
pub enum TimerError {
    #[error("scheduler error: {0}")]
    Scheduler(#[from] tokio_cron_scheduler::JobSchedulerError),
}

/// Failures surfaced by `ExecutionEngine::advance`
///
/// Configuration and delivery problems are not errors at this level: they are
/// recorded on the instance as a `Failed` transition. What remains here are
/// conditions the caller has to deal with.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    #[error("gave up on instance '{id}' after {attempts} conflicting saves")]
    ConflictRetriesExhausted { id: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Structural problems found while validating a flow definition
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("flow id must not be empty")]
    MissingId,

    #[error("entry node '{0}' does not exist")]
    UnknownEntryNode(String),

    #[error("node '{from}' references unknown successor '{to}'")]
    UnknownSuccessor { from: String, to: String },

    #[error("node '{node}' is invalid: {reason}")]
    InvalidNode { node: String, reason: String },

    #[error("node '{node}' waits {seconds}s, more than the allowed {max}s")]
    DelayOutOfRange { node: String, seconds: u64, max: u64 },
}
