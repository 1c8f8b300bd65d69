/// Flow definition layer
///
/// Flow documents produced by the builder, their SQLite persistence, and the
/// hot-reload registry the engine reads from. The engine never mutates a flow.

pub mod types;

pub mod storage;

pub mod registry;

pub use registry::{CompiledFlow, FlowRegistry};
pub use storage::FlowStorage;
pub use types::{FlowDefinition, KeywordAction, MatchMode, Node, NodeSpec, TriggerKind};
