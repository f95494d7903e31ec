//! Persistence layer: progress markers and thread correlation.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::MailStore;
