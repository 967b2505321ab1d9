pub mod client;

pub use client::FollowGraphClient;
