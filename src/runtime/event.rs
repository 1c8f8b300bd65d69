/// Events that drive an instance forward

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Input to `ExecutionEngine::advance`
///
/// The timestamp carried by the event is the engine's "now" for that call, so
/// a late-delivered tick is judged by when it fired, not by when it was read.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A timer fired (or a synthetic kick for a freshly created instance)
    Tick { at: DateTime<Utc> },
    /// The contact wrote something
    InboundMessage(InboundMessage),
}

impl Event {
    pub fn tick_now() -> Self {
        Event::Tick { at: Utc::now() }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Event::Tick { at } => *at,
            Event::InboundMessage(msg) => msg.received_at,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::Tick { .. } => "tick",
            Event::InboundMessage(_) => "inbound_message",
        }
    }
}

/// Inbound message as delivered by the channel webhook
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub conversation_id: String,
    pub text: String,
    pub received_at: DateTime<Utc>,
    /// Channel message id, when the channel provides one
    #[serde(default)]
    pub message_id: Option<String>,
}

impl InboundMessage {
    pub fn new(conversation_id: impl Into<String>, text: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            text: text.into(),
            received_at,
            message_id: None,
        }
    }

    /// De-duplication key: channel id if known, otherwise timestamp plus text
    pub fn dedup_key(&self) -> String {
        match &self.message_id {
            Some(id) => format!("id:{}", id),
            None => format!("at:{}|{}", self.received_at.timestamp_millis(), self.text),
        }
    }

    /// Shape stored in the instance context
    pub fn to_context(&self) -> Value {
        json!({
            "text": self.text,
            "receivedAt": self.received_at.to_rfc3339(),
            "messageId": self.message_id,
        })
    }
}
