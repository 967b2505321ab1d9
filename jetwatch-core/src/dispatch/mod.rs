pub mod dispatcher;
pub mod monitoring;
pub mod snapshot_cache;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use monitoring::{InMemoryMonitoringRegistry, MonitoringRegistry};
pub use snapshot_cache::SnapshotCache;
