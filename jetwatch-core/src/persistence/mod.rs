pub mod postgres;
pub mod traits;

pub use postgres::PostgresPersistence;
pub use traits::Persistence;
