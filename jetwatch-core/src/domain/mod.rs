pub mod backfill_state;
pub mod change;
pub mod follow;
pub mod ignore;
pub mod process_state;
pub mod profile;

pub use backfill_state::BackfillState;
pub use change::{ChangeCandidate, ChangeRecord, ChangeType, InsertOutcome};
pub use follow::MonitoredFollow;
pub use ignore::IgnoredDid;
pub use process_state::ProcessState;
pub use profile::ProfileSnapshot;
