/// HTTP API Layer
///
/// REST surface around the engine:
/// - Flow publishing (PUT/GET/DELETE) with hot-reload into the registry
/// - Event intake: inbound messages, structural triggers, conversation close
/// - Read-only instance inspection for operators

use crate::{
    flow::{FlowRegistry, FlowStorage},
    instance::InstanceStore,
    runtime::EventDispatcher,
};
use axum::Router;
use std::sync::Arc;

// Flow management endpoints
pub mod flows;

// Event intake endpoints
pub mod events;

// Instance inspection endpoints
pub mod instances;

/// Shared state for every handler
#[derive(Clone)]
pub struct AppState {
    pub storage: FlowStorage,
    pub registry: Arc<FlowRegistry>,
    pub store: Arc<dyn InstanceStore>,
    pub dispatcher: Arc<EventDispatcher>,
}

/// All API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(flows::create_flow_routes())
        .merge(events::create_event_routes())
        .merge(instances::create_instance_routes())
}
