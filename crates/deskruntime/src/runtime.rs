use crate::{
    AuditSink, GuardedDelete, GuardedDeleteRunner, OverridePolicy, Presenter, QueryAdapter,
    TaskExecutor, WorkflowHandle,
};
use deskcore::{
    ConfirmationPrompt, DataStore, DeleteResult, DeskError, ErrorInfo, EventBus,
    GuardedDeleteRequest, Result, TaskEvent,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Everything a screen needs, wired to one data store
pub struct DeskRuntime {
    executor: TaskExecutor,
    queries: QueryAdapter,
    audit: AuditSink,
    deletes: GuardedDeleteRunner,
    event_bus: EventBus,
    config: RuntimeConfig,
}

impl DeskRuntime {
    /// Create a runtime on the current tokio runtime.
    ///
    /// The returned [`Presenter`] must be driven from the same thread that
    /// uses the runtime.
    pub fn new(store: Arc<dyn DataStore>, config: RuntimeConfig) -> Result<(Self, Presenter)> {
        config.validate()?;

        let event_bus = EventBus::new(config.event_buffer_size);
        let (executor, presenter) = TaskExecutor::from_current(event_bus.clone())?;
        let timeout = config.query_timeout();

        let queries = QueryAdapter::new(executor.clone(), store.clone()).with_timeout(timeout);
        let audit = AuditSink::new(executor.clone(), store.clone())
            .with_timeout(timeout)
            .with_enabled(config.audit_enabled);
        let engine = Arc::new(
            GuardedDelete::new(
                store,
                OverridePolicy::new(config.override_roles.iter().cloned()),
            )
            .with_timeout(timeout),
        );
        let deletes = GuardedDeleteRunner::new(executor.clone(), engine)
            .with_audit(audit.clone(), config.audit_action.clone());

        tracing::info!(
            "Runtime ready (query timeout {}ms, override roles {:?})",
            config.query_timeout_ms,
            config.override_roles
        );

        Ok((
            Self {
                executor,
                queries,
                audit,
                deletes,
                event_bus,
                config,
            },
            presenter,
        ))
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn queries(&self) -> &QueryAdapter {
        &self.queries
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    pub fn deletes(&self) -> &GuardedDeleteRunner {
        &self.deletes
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Subscribe to task and workflow events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<TaskEvent> {
        self.event_bus.subscribe()
    }

    pub fn run_guarded_delete<C, S, E>(
        &self,
        request: GuardedDeleteRequest,
        confirm: C,
        on_success: S,
        on_error: E,
    ) -> WorkflowHandle
    where
        C: FnOnce(&ConfirmationPrompt) -> bool + 'static,
        S: FnOnce(DeleteResult) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        self.deletes.run(request, confirm, on_success, on_error)
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub query_timeout_ms: u64,
    pub event_buffer_size: usize,
    /// Roles allowed to delete subjects that still have open dependents
    pub override_roles: Vec<String>,
    pub audit_enabled: bool,
    pub audit_action: String,
}

impl RuntimeConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.query_timeout_ms == 0 {
            return Err(DeskError::Config("query_timeout_ms must be positive".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(DeskError::Config("event_buffer_size must be positive".to_string()));
        }
        Ok(())
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5_000,
            event_buffer_size: 1000,
            override_roles: vec!["admin".to_string()],
            audit_enabled: true,
            audit_action: "subject.deactivate".to_string(),
        }
    }
}
