//! Persistence layer: libSQL-backed job state, checkpoints and dead letters.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, Ownership, Restart, StaleJob};
