pub mod cursor;
pub mod protocol;

pub use cursor::{
    build_options_message, build_subscribe_url, cursor_24h_ago_micros, cursor_now_micros,
    JetstreamHostPool, SubscribeRequest, MAX_WANTED_DIDS, RETENTION_HORIZON_SECS,
};
pub use protocol::{
    CommitEvent, CommitOperation, CommitRecord, DecodedEvent, IdentityEvent, JetstreamFrame,
    OptionsUpdateMessage,
};
