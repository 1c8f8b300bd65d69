/// Event intake endpoints
///
/// The channel webhook posts inbound messages here; campaign tooling and the
/// inbox post structural triggers and conversation closes.

use crate::{
    api::AppState,
    flow::types::TriggerKind,
    runtime::{dispatcher::DispatchReport, event::InboundMessage},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::post,
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn create_event_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events/inbound", post(inbound_message))
        .route("/api/events/trigger", post(trigger))
        .route("/api/conversations/{id}/close", post(close_conversation))
}

/// Request body for a structural trigger
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    pub trigger_kind: TriggerKind,
    pub conversation_id: String,
    #[serde(default)]
    pub trigger_config: Value,
}

/// POST /api/events/inbound
/// Body: { "conversationId": "...", "text": "...", "receivedAt": "...", "messageId": "..." }
async fn inbound_message(
    State(state): State<AppState>,
    Json(message): Json<InboundMessage>,
) -> Result<Json<DispatchReport>, StatusCode> {
    tracing::info!("📥 Inbound message for conversation {}", message.conversation_id);

    match state.dispatcher.on_inbound_message(message).await {
        Ok(report) => Ok(Json(report)),
        Err(e) => {
            tracing::error!("Failed to dispatch inbound message: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/events/trigger
/// Body: { "triggerKind": "campaign_sent", "conversationId": "...", "triggerConfig": { "campaignId": "..." } }
async fn trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> Json<DispatchReport> {
    tracing::info!(
        "🎯 Trigger {} for conversation {}",
        request.trigger_kind.as_str(),
        request.conversation_id
    );
    let report = state
        .dispatcher
        .on_trigger(request.trigger_kind, &request.conversation_id, request.trigger_config)
        .await;
    Json(report)
}

/// POST /api/conversations/{id}/close
async fn close_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.dispatcher.close_conversation(&id).await {
        Ok(stopped) => Ok(Json(json!({ "conversationId": id, "stopped": stopped }))),
        Err(e) => {
            tracing::error!("Failed to close conversation {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
