//! Persistence layer: libSQL-backed storage for tasks, events, runs and
//! fitness rows.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
