pub mod ids;

pub use ids::{Cursor, Did, Handle};
