/// Action executor: the engine's only way to talk to the contact
///
/// Delivery mechanics belong to the channel. The engine hands over a resolved
/// action plus an idempotency token and only cares whether it was accepted,
/// should be retried, or can never succeed.

use crate::error::DeliveryError;
use crate::flow::types::NodeSpec;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// A side effect ready to be delivered, with every variable already resolved
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Action {
    SendTemplate { template_id: String, variables: Vec<Value> },
    CustomReply { message: String },
}

/// Channel acknowledgement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ack {
    /// Channel-side message id, when the channel returns one
    pub message_id: Option<String>,
}

#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &Action,
        conversation_id: &str,
        context: &Value,
        idempotency_token: &str,
    ) -> Result<Ack, DeliveryError>;
}

/// Build the action for a sending node, resolving variables against `context`
///
/// Returns `None` for nodes that do not send anything.
pub fn resolve_action(spec: &NodeSpec, context: &Value) -> Option<Action> {
    match spec {
        NodeSpec::SendTemplate { template_id, variables } => Some(Action::SendTemplate {
            template_id: template_id.clone(),
            variables: variables.iter().map(|v| resolve_variable(v, context)).collect(),
        }),
        NodeSpec::CustomReply { message } => Some(Action::CustomReply {
            message: render_message(message, context),
        }),
        _ => None,
    }
}

/// `$.path` expressions are looked up in the context; anything else is literal
///
/// A path that selects nothing resolves to an empty string so templates still
/// render with a blank slot instead of failing delivery.
pub fn resolve_variable(expr: &str, context: &Value) -> Value {
    let trimmed = expr.trim();
    if !trimmed.starts_with('$') {
        return Value::String(expr.to_string());
    }

    match jsonpath_lib::select(context, trimmed) {
        Ok(found) => match found.first() {
            Some(value) => (*value).clone(),
            None => {
                tracing::debug!("🔍 Variable '{}' not present in context", trimmed);
                Value::String(String::new())
            }
        },
        Err(e) => {
            tracing::warn!("⚠️ Invalid variable expression '{}': {:?}", trimmed, e);
            Value::String(expr.to_string())
        }
    }
}

/// Replace `{{$.path}}` placeholders in free text
pub fn render_message(template: &str, context: &Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let expr = after[..end].trim();
                out.push_str(&value_to_text(&resolve_variable(expr, context)));
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Delivers actions through the channel gateway's HTTP API
///
/// POST {base_url}/messages with an `Idempotency-Key` header. 408, 429, 5xx
/// and transport errors are transient; any other 4xx means the action itself
/// is wrong (unknown template, blocked recipient) and is not retried.
#[derive(Debug, Clone)]
pub struct HttpChannelExecutor {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpChannelExecutor {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }
}

#[async_trait]
impl ActionExecutor for HttpChannelExecutor {
    async fn execute(
        &self,
        action: &Action,
        conversation_id: &str,
        _context: &Value,
        idempotency_token: &str,
    ) -> Result<Ack, DeliveryError> {
        let url = format!("{}/messages", self.base_url);
        let body = json!({
            "conversationId": conversation_id,
            "action": action,
        });

        let mut request = self
            .client
            .post(&url)
            .header("Idempotency-Key", idempotency_token)
            .json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        tracing::debug!("📤 Delivering {} to {} ({})", action_kind(action), conversation_id, idempotency_token);

        let response = request
            .send()
            .await
            .map_err(|e| DeliveryError::Transient(format!("channel request failed: {}", e)))?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);

        if status.is_success() {
            return Ok(Ack {
                message_id: payload.get("messageId").and_then(|m| m.as_str()).map(str::to_string),
            });
        }

        let detail = payload
            .get("error")
            .and_then(|e| e.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());

        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            Err(DeliveryError::Transient(detail))
        } else {
            Err(DeliveryError::Configuration(detail))
        }
    }
}

/// Acknowledges every action and logs it; used when no gateway is configured
#[derive(Debug, Clone, Default)]
pub struct LoggingExecutor;

#[async_trait]
impl ActionExecutor for LoggingExecutor {
    async fn execute(
        &self,
        action: &Action,
        conversation_id: &str,
        _context: &Value,
        idempotency_token: &str,
    ) -> Result<Ack, DeliveryError> {
        tracing::info!(
            "📨 [dry-run] {} -> {} ({}): {}",
            action_kind(action),
            conversation_id,
            idempotency_token,
            serde_json::to_string(action).unwrap_or_else(|_| "invalid_json".to_string())
        );
        Ok(Ack::default())
    }
}

fn action_kind(action: &Action) -> &'static str {
    match action {
        Action::SendTemplate { .. } => "template",
        Action::CustomReply { .. } => "text",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> Value {
        json!({
            "conversationId": "conv-1",
            "lastReply": { "text": "Ana" },
            "trigger": { "config": { "campaignId": "spring", "discount": 15 } }
        })
    }

    #[test]
    fn resolves_template_variables() {
        let spec = NodeSpec::SendTemplate {
            template_id: "promo_v1".into(),
            variables: vec!["$.lastReply.text".into(), "literal".into(), "$.trigger.config.discount".into(), "$.missing".into()],
        };

        assert_eq!(
            resolve_action(&spec, &context()),
            Some(Action::SendTemplate {
                template_id: "promo_v1".into(),
                variables: vec![json!("Ana"), json!("literal"), json!(15), json!("")],
            })
        );
    }

    #[test]
    fn renders_placeholders_in_free_text() {
        assert_eq!(
            render_message("Hi {{ $.lastReply.text }}, {{$.trigger.config.discount}}% off!", &context()),
            "Hi Ana, 15% off!"
        );
        assert_eq!(render_message("Unclosed {{ brace", &context()), "Unclosed {{ brace");
        assert_eq!(render_message("Plain", &context()), "Plain");
    }

    #[test]
    fn waits_do_not_produce_actions() {
        assert!(resolve_action(&NodeSpec::TimeGap { delay_seconds: 5 }, &context()).is_none());
    }

    #[test]
    fn action_wire_shape() {
        let action = Action::SendTemplate { template_id: "t".into(), variables: vec![] };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({ "type": "send_template", "templateId": "t", "variables": [] })
        );
    }

    #[tokio::test]
    async fn logging_executor_always_acks() {
        let ack = LoggingExecutor
            .execute(&Action::CustomReply { message: "hi".into() }, "conv-1", &context(), "tok")
            .await;
        assert_eq!(ack, Ok(Ack::default()));
    }
}
