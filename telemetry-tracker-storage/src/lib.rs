pub mod events;
pub mod postgres;

pub use events::*;
pub use postgres::{PostgresConfig, PoolStatus};
