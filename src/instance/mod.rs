/// Automation instance layer
///
/// Runtime records for in-flight automations, their SQLite store with
/// optimistic concurrency, and the per-instance lease table.

pub mod types;

pub mod store;

pub mod lease;

pub use lease::{Lease, LeaseManager};
pub use store::{InstanceStore, SqliteInstanceStore};
pub use types::{AutomationInstance, InstanceState};
