/// Automation instance: the runtime state of one flow against one conversation
///
/// Instances are owned by the execution engine. Everything the engine needs to
/// resume after a restart lives on this record; nothing is held in memory
/// between events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How many inbound message keys an instance remembers for de-duplication
pub const SEEN_MESSAGES_LIMIT: usize = 32;

/// Lifecycle state of an instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Running,
    WaitingForReply,
    WaitingForTimer,
    Completed,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed | InstanceState::Stopped | InstanceState::Failed
        )
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, InstanceState::WaitingForReply | InstanceState::WaitingForTimer)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Running => "running",
            InstanceState::WaitingForReply => "waiting_for_reply",
            InstanceState::WaitingForTimer => "waiting_for_timer",
            InstanceState::Completed => "completed",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(InstanceState::Running),
            "waiting_for_reply" => Some(InstanceState::WaitingForReply),
            "waiting_for_timer" => Some(InstanceState::WaitingForTimer),
            "completed" => Some(InstanceState::Completed),
            "stopped" => Some(InstanceState::Stopped),
            "failed" => Some(InstanceState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One live (or retained) execution of a flow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutomationInstance {
    pub id: String,
    pub flow_id: String,
    pub conversation_id: String,
    pub current_node_id: String,
    pub state: InstanceState,
    /// Set while waiting on a reply window or a time gap
    pub deadline: Option<DateTime<Utc>>,
    /// Variables collected so far (trigger payload, last reply, ...)
    pub context: Value,
    /// Number of `advance` calls that applied their event
    pub execution_count: i64,
    pub last_error: Option<String>,
    /// Bumped on every node transition; feeds the delivery idempotency token
    pub step_seq: i64,
    /// Keys of recently applied inbound messages, oldest first
    pub seen_messages: Vec<String>,
    /// Optimistic-lock counter maintained by the store
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AutomationInstance {
    /// Fresh instance positioned at the flow's entry node
    pub fn new(
        flow_id: impl Into<String>,
        entry_node_id: impl Into<String>,
        conversation_id: impl Into<String>,
        trigger: Value,
    ) -> Self {
        let now = Utc::now();
        let conversation_id = conversation_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            flow_id: flow_id.into(),
            context: json!({
                "conversationId": conversation_id.clone(),
                "trigger": trigger,
            }),
            conversation_id,
            current_node_id: entry_node_id.into(),
            state: InstanceState::Running,
            deadline: None,
            execution_count: 0,
            last_error: None,
            step_seq: 0,
            seen_messages: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to another node; clears any pending wait
    pub fn move_to(&mut self, node_id: impl Into<String>) {
        self.current_node_id = node_id.into();
        self.state = InstanceState::Running;
        self.deadline = None;
        self.step_seq += 1;
    }

    /// Park the instance until `deadline` (or indefinitely for `None`)
    pub fn suspend(&mut self, state: InstanceState, deadline: Option<DateTime<Utc>>) {
        self.state = state;
        self.deadline = deadline;
    }

    pub fn complete(&mut self) {
        self.state = InstanceState::Completed;
        self.deadline = None;
    }

    pub fn stop(&mut self) {
        self.state = InstanceState::Stopped;
        self.deadline = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = InstanceState::Failed;
        self.deadline = None;
        self.last_error = Some(error.into());
    }

    pub fn has_seen(&self, message_key: &str) -> bool {
        self.seen_messages.iter().any(|k| k == message_key)
    }

    pub fn remember_message(&mut self, message_key: String) {
        self.seen_messages.push(message_key);
        if self.seen_messages.len() > SEEN_MESSAGES_LIMIT {
            let overflow = self.seen_messages.len() - SEEN_MESSAGES_LIMIT;
            self.seen_messages.drain(..overflow);
        }
    }

    /// Token handed to the action executor for the current step
    ///
    /// Stable across delivery retries and crash replays of the same step,
    /// different for every revisit of a node.
    pub fn idempotency_token(&self) -> String {
        format!("{}:{}", self.id, self.step_seq)
    }

    /// Write a top-level context variable
    pub fn set_var(&mut self, key: &str, value: Value) {
        if !self.context.is_object() {
            self.context = json!({});
        }
        if let Some(map) = self.context.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    pub fn var(&self, key: &str) -> Option<&Value> {
        self.context.get(key)
    }
}
