//! SQLite implementation of the data store capability.
//!
//! Every acquire opens its own connection on the database file, so nothing
//! is shared between tasks. Lock waits are bounded by `busy_timeout_ms`;
//! running out of it surfaces as a timeout. A deadline set on a connection
//! interrupts the running statement through SQLite's progress handler.

use crate::schema;
use deskcore::{
    Connection, DataStore, Deadline, Query, Row, RowSet, StoreError, StoreErrorCode, Value,
};
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{ffi, params_from_iter, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Virtual machine instructions between deadline checks
const PROGRESS_OPS: i32 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteStoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl SqliteStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }
}

impl Default for SqliteStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("clientdesk.db"),
            busy_timeout_ms: 5_000,
        }
    }
}

pub struct SqliteStore {
    config: SqliteStoreConfig,
}

impl SqliteStore {
    /// Open the database, creating the file and applying migrations as needed
    pub fn open(config: SqliteStoreConfig) -> Result<Self, StoreError> {
        let store = Self { config };
        let conn = store.connect(OpenFlags::SQLITE_OPEN_CREATE)?;
        schema::migrate(&conn).map_err(|e| store.classify(e))?;
        tracing::info!("Opened SQLite store at {}", store.path().display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Insert the demo clients and invoices unless they are already there
    pub fn seed_demo(&self) -> Result<(), StoreError> {
        let conn = self.connect(OpenFlags::empty())?;
        schema::seed_demo(&conn).map_err(|e| self.classify(e))
    }

    fn connect(&self, extra: OpenFlags) -> Result<rusqlite::Connection, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX | extra;
        let conn = rusqlite::Connection::open_with_flags(&self.config.path, flags).map_err(|e| {
            StoreError::Connection(format!("{}: {}", self.config.path.display(), e))
        })?;
        conn.busy_timeout(Duration::from_millis(self.config.busy_timeout_ms))
            .map_err(|e| self.classify(e))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| self.classify(e))?;
        Ok(conn)
    }

    fn classify(&self, err: rusqlite::Error) -> StoreError {
        classify(err, self.config.busy_timeout_ms)
    }
}

impl DataStore for SqliteStore {
    fn acquire(&self) -> Result<Box<dyn Connection>, StoreError> {
        let conn = self.connect(OpenFlags::empty())?;
        Ok(Box::new(SqliteConnection {
            conn,
            busy_timeout_ms: self.config.busy_timeout_ms,
            deadline: None,
        }))
    }
}

struct SqliteConnection {
    conn: rusqlite::Connection,
    busy_timeout_ms: u64,
    deadline: Option<Deadline>,
}

impl SqliteConnection {
    fn classify(&self, err: rusqlite::Error) -> StoreError {
        match self.deadline {
            Some(deadline) if err.sqlite_error_code() == Some(ErrorCode::OperationInterrupted) => {
                deadline.timeout()
            }
            _ => classify(err, self.busy_timeout_ms),
        }
    }

    fn clear_progress_handler(&self) {
        self.conn.progress_handler(0, None::<fn() -> bool>);
    }
}

impl Connection for SqliteConnection {
    fn query(&mut self, query: &Query) -> Result<RowSet, StoreError> {
        let mut stmt = self
            .conn
            .prepare(query.sql())
            .map_err(|e| self.classify(e))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let mut rows = stmt
            .query(params_from_iter(query.params().iter().map(to_sql)))
            .map_err(|e| self.classify(e))?;
        let mut collected = Vec::new();
        while let Some(row) = rows.next().map_err(|e| self.classify(e))? {
            let mut values: Row = Vec::with_capacity(width);
            for i in 0..width {
                let value = row.get_ref(i).map_err(|e| self.classify(e))?;
                values.push(from_sql(value));
            }
            collected.push(values);
        }

        Ok(RowSet::new(columns, collected))
    }

    fn execute(&mut self, query: &Query) -> Result<u64, StoreError> {
        let affected = self
            .conn
            .execute(query.sql(), params_from_iter(query.params().iter().map(to_sql)))
            .map_err(|e| self.classify(e))?;
        Ok(affected as u64)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| self.classify(e))
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT").map_err(|e| self.classify(e))
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        // SQLite may already have rolled back on its own
        if self.conn.is_autocommit() {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK").map_err(|e| self.classify(e))
    }

    fn set_deadline(&mut self, deadline: Option<Deadline>) {
        self.deadline = deadline;
        match deadline {
            Some(deadline) => {
                let at = deadline.at();
                self.conn
                    .progress_handler(PROGRESS_OPS, Some(move || Instant::now() >= at));
            }
            None => self.clear_progress_handler(),
        }
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.conn.is_autocommit() {
            tracing::warn!("Connection released inside a transaction, rolling back");
            self.clear_progress_handler();
            if let Err(e) = self.conn.execute_batch("ROLLBACK") {
                tracing::error!("Rollback on release failed: {}", e);
            }
        }
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(n) => SqlValue::Integer(*n),
        Value::Real(n) => SqlValue::Real(*n),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Blob(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Integer(n),
        ValueRef::Real(n) => Value::Real(n),
        ValueRef::Text(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    }
}

/// Map a SQLite failure onto the store taxonomy, keeping the extended result
/// code so key collisions can be told apart from other constraint failures
pub(crate) fn classify(err: rusqlite::Error, busy_timeout_ms: u64) -> StoreError {
    let rusqlite::Error::SqliteFailure(failure, message) = &err else {
        return StoreError::storage(err.to_string());
    };
    let message = message.clone().unwrap_or_else(|| failure.to_string());

    match failure.code {
        ErrorCode::CannotOpen | ErrorCode::NotADatabase | ErrorCode::PermissionDenied => {
            StoreError::Connection(message)
        }
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StoreError::Timeout {
            millis: busy_timeout_ms,
        },
        ErrorCode::ConstraintViolation => {
            let code = match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_PRIMARYKEY => StoreErrorCode::DuplicateKey,
                ffi::SQLITE_CONSTRAINT_UNIQUE => StoreErrorCode::UniqueViolation,
                _ => StoreErrorCode::Constraint,
            };
            StoreError::with_code(code, message)
        }
        _ => StoreError::with_code(StoreErrorCode::Engine(failure.extended_code), message),
    }
}
