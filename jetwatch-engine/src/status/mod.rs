pub mod broadcaster;

pub use broadcaster::{
    BroadcastMessage, CursorUpdate, MainStreamStatusView, StatusBroadcaster, StatusSnapshot,
    TempPoolStatusView, UserBackfillStatusView,
};
