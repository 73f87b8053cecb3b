//! Scripted in-memory store shared by the integration tests

#![allow(dead_code)]

use deskcore::{Actor, Connection, DataStore, GuardedDeleteRequest, Query, Row, RowSet, StoreError, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CHECK: &str = "SELECT COUNT(*) FROM invoices WHERE client_id = ?1 AND status IN ('pending', 'overdue')";
pub const DEACTIVATE: &str = "UPDATE clients SET active = 0 WHERE id = ?1 AND active = 1";
pub const CLOSE: &str =
    "UPDATE invoices SET status = 'closed_by_override' WHERE client_id = ?1 AND status IN ('pending', 'overdue')";
pub const REPAIR: &str = "UPDATE id_sequences SET value = (SELECT MAX(id) FROM client_status_log)";

/// Initialize tracing for tests
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
    Fail(StoreError),
    /// Sleep on the worker before answering
    Slow(Duration, Box<Reply>),
}

impl Reply {
    pub fn count(n: i64) -> Self {
        Reply::Rows(vec![vec![Value::Integer(n)]])
    }
}

struct Script {
    pattern: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct State {
    scripts: Vec<Script>,
    log: Vec<String>,
    refuse: Option<StoreError>,
}

/// Answers statements by substring match and records everything it was sent.
///
/// A script with several replies hands them out in order and then keeps
/// repeating the last one.
#[derive(Clone, Default)]
pub struct ScriptedStore {
    state: Arc<Mutex<State>>,
}

impl ScriptedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later scripts take precedence over earlier ones
    pub fn on(self, pattern: &str, replies: impl IntoIterator<Item = Reply>) -> Self {
        self.state.lock().unwrap().scripts.insert(0, Script {
            pattern: pattern.to_string(),
            replies: replies.into_iter().collect(),
        });
        self
    }

    /// Make every acquire fail
    pub fn refusing(self, error: StoreError) -> Self {
        self.state.lock().unwrap().refuse = Some(error);
        self
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn count_of(&self, fragment: &str) -> usize {
        self.log().iter().filter(|entry| entry.contains(fragment)).count()
    }

    pub fn shared(&self) -> Arc<dyn DataStore> {
        Arc::new(self.clone())
    }

    fn answer(&self, sql: &str) -> Reply {
        let mut state = self.state.lock().unwrap();
        state.log.push(sql.to_string());
        let script = state
            .scripts
            .iter_mut()
            .find(|script| sql.contains(&script.pattern));
        match script {
            Some(script) if script.replies.len() > 1 => script.replies.pop_front().unwrap(),
            Some(script) => script.replies.front().cloned().unwrap_or(Reply::Affected(0)),
            None => Reply::Affected(0),
        }
    }

    fn mark(&self, entry: &str) {
        self.state.lock().unwrap().log.push(entry.to_string());
    }
}

impl DataStore for ScriptedStore {
    fn acquire(&self) -> Result<Box<dyn Connection>, StoreError> {
        if let Some(error) = self.state.lock().unwrap().refuse.clone() {
            return Err(error);
        }
        Ok(Box::new(ScriptedConnection {
            store: self.clone(),
            in_transaction: false,
        }))
    }
}

struct ScriptedConnection {
    store: ScriptedStore,
    in_transaction: bool,
}

fn resolve(reply: Reply) -> Reply {
    match reply {
        Reply::Slow(delay, inner) => {
            std::thread::sleep(delay);
            resolve(*inner)
        }
        other => other,
    }
}

impl Connection for ScriptedConnection {
    fn query(&mut self, query: &Query) -> Result<RowSet, StoreError> {
        match resolve(self.store.answer(query.sql())) {
            Reply::Rows(rows) => Ok(RowSet::new(vec!["value".to_string()], rows)),
            Reply::Affected(_) => Ok(RowSet::empty()),
            Reply::Fail(e) => Err(e),
            Reply::Slow(..) => unreachable!(),
        }
    }

    fn execute(&mut self, query: &Query) -> Result<u64, StoreError> {
        match resolve(self.store.answer(query.sql())) {
            Reply::Affected(n) => Ok(n),
            Reply::Rows(rows) => Ok(rows.len() as u64),
            Reply::Fail(e) => Err(e),
            Reply::Slow(..) => unreachable!(),
        }
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.in_transaction = true;
        self.store.mark("BEGIN");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        self.store.mark("COMMIT");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        self.store.mark("ROLLBACK");
        Ok(())
    }
}

impl Drop for ScriptedConnection {
    fn drop(&mut self) {
        if self.in_transaction {
            self.store.mark("ROLLBACK (dropped)");
        }
    }
}

/// Guarded delete of client `subject_id` with the canned invoice statements
pub fn delete_request(subject_id: i64, role: &str) -> GuardedDeleteRequest {
    GuardedDeleteRequest::new(
        subject_id,
        Actor::new(7, role),
        Query::new(CHECK).bind(subject_id),
        Query::new(DEACTIVATE).bind(subject_id),
        Query::new(CLOSE).bind(subject_id),
    )
    .with_sequence_repair(Query::new(REPAIR))
}

/// Store where client 42 has `open` blocking invoices
pub fn client_store(open: i64) -> ScriptedStore {
    ScriptedStore::new()
        .on("SELECT COUNT(*) FROM invoices", [Reply::count(open)])
        .on("UPDATE clients", [Reply::Affected(1)])
        .on("UPDATE invoices", [Reply::Affected(open as u64)])
        .on("UPDATE id_sequences", [Reply::Affected(1)])
}
