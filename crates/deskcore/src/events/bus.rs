use crate::{OutcomeKind, RunId, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Identifier of one submitted task
pub type CallId = u64;

/// Events emitted by the executor and by workflow runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TaskEvent {
    Submitted {
        call_id: CallId,
        label: String,
        timestamp: DateTime<Utc>,
    },
    /// The task finished on its worker; delivery has not happened yet
    Completed {
        call_id: CallId,
        outcome: OutcomeKind,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Delivered {
        call_id: CallId,
        outcome: OutcomeKind,
        timestamp: DateTime<Utc>,
    },
    /// A result arrived for a call nobody is waiting on any more
    Discarded {
        call_id: CallId,
        timestamp: DateTime<Utc>,
    },
    BusyChanged {
        busy: bool,
        timestamp: DateTime<Utc>,
    },
    WorkflowTransition {
        run_id: RunId,
        subject_id: i64,
        state: WorkflowState,
        timestamp: DateTime<Utc>,
    },
}

/// Emitter scoped to one workflow run
#[derive(Debug, Clone)]
pub struct EventEmitter {
    run_id: RunId,
    sender: broadcast::Sender<TaskEvent>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, sender: broadcast::Sender<TaskEvent>) -> Self {
        Self { run_id, sender }
    }

    pub fn transition(&self, subject_id: i64, state: WorkflowState) {
        let _ = self.sender.send(TaskEvent::WorkflowTransition {
            run_id: self.run_id,
            subject_id,
            state,
            timestamp: Utc::now(),
        });
    }
}

/// Process-wide event bus. Sending never blocks and nobody has to listen.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<TaskEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: TaskEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, run_id: RunId) -> EventEmitter {
        EventEmitter::new(run_id, self.sender.clone())
    }
}
