pub mod manager;
pub mod stream;

pub use manager::{BackfillManager, CanStart, StartOutcome, TempPoolStatus};
pub use stream::{run_temp_stream, TempStreamRequest};
