//! The data store capability consumed by the runtime.
//!
//! Stores hand out one connection per task. A connection is released when
//! the box is dropped, so every exit path of a task gives it back,
//! including early returns through `?`. Implementations must roll back an
//! open transaction when dropped.

use crate::{StoreError, Value};
use std::fmt;
use std::time::{Duration, Instant};

/// Parameterized statement. Values are always bound, never spliced into the SQL.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    sql: String,
    params: Vec<Value>,
}

impl Query {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

pub type Row = Vec<Value>;

/// Fully materialized result of a query
#[derive(Debug, Clone)]
pub struct RowSet {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// First column of the first remaining row, if any
    pub fn first_value(mut self) -> Option<Value> {
        self.rows.next().and_then(|row| row.into_iter().next())
    }
}

impl Iterator for RowSet {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for RowSet {}

/// Point in time after which a unit of work must stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn at(&self) -> Instant {
        self.at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// The error reported once the deadline has passed
    pub fn timeout(&self) -> StoreError {
        StoreError::Timeout {
            millis: u64::try_from(self.budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn check(&self) -> Result<(), StoreError> {
        if self.is_expired() {
            Err(self.timeout())
        } else {
            Ok(())
        }
    }
}

/// A single acquired connection
pub trait Connection {
    fn query(&mut self, query: &Query) -> Result<RowSet, StoreError>;

    /// Run a mutation and return the affected row count
    fn execute(&mut self, query: &Query) -> Result<u64, StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self) -> Result<(), StoreError>;

    /// Bound the statements run from now on. Stores that can stop a running
    /// statement should fail it with `StoreError::Timeout` once the deadline
    /// passes; `None` lifts the bound.
    fn set_deadline(&mut self, _deadline: Option<Deadline>) {}
}

pub trait DataStore: Send + Sync {
    /// Acquire a connection, failing with `StoreError::Connection` when the store is unreachable
    fn acquire(&self) -> Result<Box<dyn Connection>, StoreError>;
}
