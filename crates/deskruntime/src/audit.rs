use crate::executor::{SubmitOptions, TaskExecutor};
use crate::query::DEFAULT_QUERY_TIMEOUT;
use deskcore::{AuditEvent, DataStore, Query};
use std::sync::Arc;
use std::time::Duration;

pub const AUDIT_INSERT: &str =
    "INSERT INTO audit_log (actor_id, action, details, created_at) VALUES (?1, ?2, ?3, ?4)";

/// Fire-and-forget audit writer.
///
/// Each record is one task with one attempt. A failed write is logged and
/// otherwise dropped; callers never see it.
#[derive(Clone)]
pub struct AuditSink {
    executor: TaskExecutor,
    store: Arc<dyn DataStore>,
    statement: Arc<str>,
    timeout: Duration,
    enabled: bool,
}

impl AuditSink {
    pub fn new(executor: TaskExecutor, store: Arc<dyn DataStore>) -> Self {
        Self {
            executor,
            store,
            statement: Arc::from(AUDIT_INSERT),
            timeout: DEFAULT_QUERY_TIMEOUT,
            enabled: true,
        }
    }

    /// Use a different insert. It receives actor id, action, details and
    /// an RFC 3339 timestamp as ?1..?4.
    pub fn with_statement(mut self, sql: impl Into<String>) -> Self {
        self.statement = Arc::from(sql.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn record(&self, actor_id: i64, action: impl Into<String>, details: impl Into<String>) {
        self.record_event(AuditEvent::new(actor_id, action, details));
    }

    pub fn record_event(&self, event: AuditEvent) {
        if !self.enabled {
            tracing::debug!("Audit disabled, dropping '{}'", event.action);
            return;
        }

        let query = Query::new(self.statement.to_string())
            .bind(event.actor_id)
            .bind(event.action.as_str())
            .bind(event.details.as_str())
            .bind(event.timestamp.to_rfc3339());
        let store = self.store.clone();
        let options = SubmitOptions::new("audit").with_timeout(self.timeout);

        self.executor.submit_with(
            options,
            move |_| {
                let mut conn = store.acquire()?;
                conn.execute(&query)?;
                Ok(())
            },
            |()| {},
            move |err| {
                tracing::warn!(
                    "Audit event '{}' for actor {} was not recorded: {}",
                    event.action,
                    event.actor_id,
                    err
                );
            },
        );
    }
}
