/// Runtime: everything that moves an instance forward
///
/// - `engine`: the per-instance state machine (`advance`)
/// - `dispatcher`: routes inbound messages, triggers and ticks to instances
/// - `timer`: durable wake-ups for waiting instances
/// - `actions`: the outbound side-effect boundary (template / text sends)
/// - `keyword`: literal keyword matching shared by triggers and branches

pub mod actions;
pub mod dispatcher;
pub mod engine;
pub mod event;
pub mod keyword;
pub mod timer;

pub use actions::{Action, ActionExecutor, HttpChannelExecutor, LoggingExecutor};
pub use dispatcher::{DispatchReport, EventDispatcher};
pub use engine::{EngineConfig, ExecutionEngine};
pub use event::{Event, InboundMessage};
pub use timer::{TimerScheduler, TimerService, TimerTick};
