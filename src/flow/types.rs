/// Flow definition types
///
/// This is the document a builder UI produces. Field names and node tags are the
/// wire shape, so they are serialized in camelCase / snake_case exactly as the
/// builder sends them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A complete automation: trigger plus node graph
///
/// Nodes live in a map keyed by id and each node carries its own successor,
/// so reordering steps in the builder never rewires the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Unique flow identifier (e.g., "welcome-series")
    pub id: String,
    /// Human-readable name shown in the builder
    #[serde(default)]
    pub name: String,
    /// Builder-side revision counter, informational only
    #[serde(default)]
    pub version: i64,
    /// What spawns new instances of this flow
    pub trigger_kind: TriggerKind,
    /// Trigger-specific options (keyword list, campaign filter)
    #[serde(default)]
    pub trigger_config: Value,
    /// All nodes of the flow keyed by node id
    pub nodes: HashMap<String, Node>,
    /// First node executed by a fresh instance
    pub entry_node_id: String,
}

impl FlowDefinition {
    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.nodes.get(node_id)
    }

    /// Keywords configured on a `keyword` trigger, if any
    pub fn trigger_keywords(&self) -> Vec<String> {
        self.trigger_config
            .get("keywords")
            .and_then(|k| k.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|k| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Match mode configured on a `keyword` trigger (defaults to substring)
    pub fn trigger_match_mode(&self) -> MatchMode {
        self.trigger_config
            .get("matchMode")
            .and_then(|m| serde_json::from_value(m.clone()).ok())
            .unwrap_or_default()
    }

    /// Whether a `campaign_sent` trigger applies to the given trigger payload
    ///
    /// A flow without a `campaignId` filter reacts to every campaign.
    pub fn accepts_campaign(&self, trigger_config: &Value) -> bool {
        match self.trigger_config.get("campaignId").and_then(|c| c.as_str()) {
            Some(wanted) => trigger_config.get("campaignId").and_then(|c| c.as_str()) == Some(wanted),
            None => true,
        }
    }
}

/// Events that can spawn a new instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    NewConversation,
    Keyword,
    MessageReceived,
    CampaignSent,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::NewConversation => "new_conversation",
            TriggerKind::Keyword => "keyword",
            TriggerKind::MessageReceived => "message_received",
            TriggerKind::CampaignSent => "campaign_sent",
        }
    }
}

/// One step of a flow plus its default successor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    #[serde(flatten)]
    pub spec: NodeSpec,
    /// Default successor; `None` ends the flow
    #[serde(default)]
    pub next_node_id: Option<String>,
}

/// The five step variants a builder can place
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NodeSpec {
    /// Wait for the contact to answer, or give up after `wait_seconds`
    UserReply { wait_seconds: u64 },

    /// Pause the flow for `delay_seconds`
    TimeGap { delay_seconds: u64 },

    /// Send an approved message template
    SendTemplate {
        template_id: String,
        #[serde(default)]
        variables: Vec<String>,
    },

    /// Send free text; `{{$.path}}` placeholders are filled from the context
    CustomReply { message: String },

    /// Branch on the most recent inbound message
    KeywordCatch {
        keywords: Vec<String>,
        action: KeywordAction,
        #[serde(default)]
        match_mode: MatchMode,
    },
}

impl NodeSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            NodeSpec::UserReply { .. } => "user_reply",
            NodeSpec::TimeGap { .. } => "time_gap",
            NodeSpec::SendTemplate { .. } => "send_template",
            NodeSpec::CustomReply { .. } => "custom_reply",
            NodeSpec::KeywordCatch { .. } => "keyword_catch",
        }
    }
}

/// What a matched `keyword_catch` does
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum KeywordAction {
    Continue,
    Stop,
    Jump { target_node_id: String },
}

/// How keywords are compared with message text (always case-insensitive)
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Keyword appears anywhere in the text
    #[default]
    Contains,
    /// Keyword equals one whole word of the text
    Token,
}
