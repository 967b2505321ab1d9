//! Domain types, wire protocol, handle resolution, persistence, and event
//! dispatch for the Jetstream ingestion and backfill engine. No process
//! entry point lives here — see `jetwatch-engine` for that.

pub mod dispatch;
pub mod domain;
pub mod error;
pub mod jetstream;
pub mod persistence;
pub mod resolver;
pub mod types;

pub use error::{EngineError, Result};
