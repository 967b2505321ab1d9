use crate::types::Handle;

/// In-memory-only snapshot of what we last saw for a DID's profile. Never
/// persisted and never survives a restart; bootstrapped lazily from
/// `Persistence::last_known_handle` on first touch.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileSnapshot {
    pub display_name: String,
    pub avatar_ref: String,
    pub handle: Handle,
}

impl ProfileSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            ..Default::default()
        }
    }
}
