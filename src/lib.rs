/// convoflow: durable automation engine for conversational marketing flows
///
/// Published flows (trigger + node graph) are executed per conversation as
/// persisted state machines that suspend on reply windows and time gaps and
/// resume on inbound messages or timer ticks.

// Core configuration and setup
pub mod config;

// Typed error taxonomy
pub mod error;

// SQLite pool and schema bootstrap
pub mod database;

// Flow definitions: document types, storage and hot-reload registry
pub mod flow;

// Automation instances: records, durable store and per-instance leases
pub mod instance;

// Runtime: execution engine, dispatcher, timers and action delivery
pub mod runtime;

// HTTP API layer - flow publishing, event intake and instance inspection
pub mod api;

// Server setup and initialization
pub mod server;

pub use flow::{FlowDefinition, FlowRegistry, Node, NodeSpec, TriggerKind};
pub use instance::{AutomationInstance, InstanceState};
pub use runtime::{Event, EventDispatcher, ExecutionEngine, InboundMessage};
pub use server::start_server;
