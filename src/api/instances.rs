/// Read-only instance inspection
///
/// Operators use these to see where a contact is in a flow and why an
/// instance failed (`lastError`).

use crate::{api::AppState, instance::AutomationInstance};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};

pub fn create_instance_routes() -> Router<AppState> {
    Router::new()
        .route("/api/instances/{id}", get(get_instance))
        .route("/api/conversations/{id}/instances", get(list_conversation_instances))
}

/// GET /api/instances/{id}
async fn get_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AutomationInstance>, StatusCode> {
    match state.store.load(&id).await {
        Ok(Some(instance)) => Ok(Json(instance)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to load instance {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/conversations/{id}/instances
/// Returns every instance of the conversation, newest first
async fn list_conversation_instances(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.store.list_by_conversation(&id).await {
        Ok(instances) => Ok(Json(json!({ "conversationId": id, "instances": instances }))),
        Err(e) => {
            tracing::error!("Failed to list instances for conversation {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
