/// Flow management REST API endpoints
///
/// Publishing validates the document, persists it and swaps it into the
/// registry in one call. Deleting a flow stops its live instances.

use crate::{api::AppState, error::FlowError, flow::types::FlowDefinition};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};

pub fn create_flow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/flows", get(list_flows))
        .route("/api/flows/{id}", get(get_flow).put(publish_flow).delete(delete_flow))
}

/// Publish (create or replace) a flow
///
/// PUT /api/flows/{id}
/// Body: the flow document; its `id` is taken from the URL.
/// Returns 422 with the validation error when the graph is malformed.
async fn publish_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut flow): Json<FlowDefinition>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    flow.id = id;

    match state.registry.publish(flow).await {
        Ok(compiled) => Ok(Json(json!({
            "id": compiled.flow.id,
            "message": format!("Flow '{}' published", compiled.flow.id),
            "unreachableNodes": compiled.unreachable_nodes,
            "hasCycle": compiled.has_cycle,
        }))),
        Err(e) => match e.downcast_ref::<FlowError>() {
            Some(invalid) => Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": invalid.to_string() })),
            )),
            None => {
                tracing::error!("Failed to publish flow: {}", e);
                Err((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed to publish flow" })),
                ))
            }
        },
    }
}

/// GET /api/flows
async fn list_flows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.storage.list_flows().await {
        Ok(flows) => Ok(Json(json!({ "flows": flows }))),
        Err(e) => {
            tracing::error!("Failed to list flows: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/flows/{id}
async fn get_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<FlowDefinition>, StatusCode> {
    match state.storage.get_flow(&id).await {
        Ok(Some(flow)) => Ok(Json(flow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get flow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/flows/{id}
///
/// Live instances of the flow are stopped and their timers cancelled.
async fn delete_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.dispatcher.retire_flow(&id).await {
        Ok(true) => {
            tracing::info!("Deleted flow: {}", id);
            Ok(Json(json!({ "message": "Flow deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to delete flow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
