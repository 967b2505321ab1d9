//! Library surface for the Jetstream ingestion and backfill engine's
//! process shell: the main stream manager, the temporary backfill
//! pool, the status broadcaster, configuration loading, and
//! the composition root. `main.rs` is a thin binary over this crate so
//! integration tests can exercise the same types without re-linking a
//! binary.

pub mod app_context;
pub mod backfill;
pub mod config;
pub mod follow_graph;
pub mod main_stream;
pub mod status;
