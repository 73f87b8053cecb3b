use crate::executor::{CallHandle, SubmitOptions, TaskExecutor};
use deskcore::{Connection, DataStore, ErrorInfo, Query, RowSet, StoreError, TaskError, Value};
use std::sync::Arc;
use std::time::Duration;

/// Timeout applied to every adapter call
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Canned task shapes for screens: count, sum, row processing and update.
///
/// Each call acquires its own connection on the worker and releases it
/// before the outcome is posted back. Timeouts surface as failures.
#[derive(Clone)]
pub struct QueryAdapter {
    executor: TaskExecutor,
    store: Arc<dyn DataStore>,
    timeout: Duration,
}

impl QueryAdapter {
    pub fn new(executor: TaskExecutor, store: Arc<dyn DataStore>) -> Self {
        Self {
            executor,
            store,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// First column of the first row as an integer, 0 when there is no row
    pub fn count_of<S, E>(&self, query: Query, on_success: S, on_error: E) -> CallHandle
    where
        S: FnOnce(i64) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        self.run(
            "count",
            query,
            |conn, q| Ok(count_rows(conn, q)?),
            on_success,
            on_error,
        )
    }

    /// First column of the first row as a float, 0.0 when there is no row
    pub fn sum_of<S, E>(&self, query: Query, on_success: S, on_error: E) -> CallHandle
    where
        S: FnOnce(f64) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        self.run(
            "sum",
            query,
            |conn, q| {
                let value = conn.query(q)?.first_value().unwrap_or(Value::Null);
                match value {
                    Value::Null => Ok(0.0),
                    other => other
                        .as_f64()
                        .ok_or_else(|| TaskError::from(non_numeric(q, &other))),
                }
            },
            on_success,
            on_error,
        )
    }

    /// Hand the rows to `processor` on the worker and deliver what it returns.
    /// The rows never leave the worker.
    pub fn rows_of<R, P, S, E>(
        &self,
        query: Query,
        processor: P,
        on_success: S,
        on_error: E,
    ) -> CallHandle
    where
        R: Send + 'static,
        P: FnOnce(RowSet) -> Result<R, TaskError> + Send + 'static,
        S: FnOnce(R) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        self.run(
            "rows",
            query,
            move |conn, q| processor(conn.query(q)?),
            on_success,
            on_error,
        )
    }

    /// Run a mutation and deliver the affected row count
    pub fn update_with<S, E>(&self, query: Query, on_success: S, on_error: E) -> CallHandle
    where
        S: FnOnce(u64) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        self.run(
            "update",
            query,
            |conn, q| Ok(conn.execute(q)?),
            on_success,
            on_error,
        )
    }

    fn run<T, W, S, E>(
        &self,
        shape: &str,
        query: Query,
        work: W,
        on_success: S,
        on_error: E,
    ) -> CallHandle
    where
        T: Send + 'static,
        W: FnOnce(&mut dyn Connection, &Query) -> Result<T, TaskError> + Send + 'static,
        S: FnOnce(T) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        let store = self.store.clone();
        let options =
            SubmitOptions::new(format!("{}: {}", shape, query.sql())).with_timeout(self.timeout);

        self.executor.submit_with(
            options,
            move |_| {
                let mut conn = store.acquire()?;
                work(conn.as_mut(), &query)
            },
            on_success,
            on_error,
        )
    }
}

/// Integer in the first column of the first row; no row or NULL counts as 0
pub(crate) fn count_rows(conn: &mut dyn Connection, query: &Query) -> Result<i64, StoreError> {
    let value = conn.query(query)?.first_value().unwrap_or(Value::Null);
    match value {
        Value::Null => Ok(0),
        other => other.as_i64().ok_or_else(|| non_numeric(query, &other)),
    }
}

fn non_numeric(query: &Query, value: &Value) -> StoreError {
    StoreError::storage(format!("'{}' returned a non-numeric value: {:?}", query, value))
}
