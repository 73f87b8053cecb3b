//! SQLite data store for clientdesk
//!
//! Implements the `DataStore` capability on a SQLite file, owns the schema
//! and provides the statements the client screens run.

mod schema;
mod sqlite;
pub mod statements;

pub use schema::STATUS_LOG_SEQUENCE;
pub use sqlite::{SqliteStore, SqliteStoreConfig};
