use crate::events::EventEmitter;
use crate::Query;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type RunId = Uuid;

/// Role name of the acting user, as assigned by the login layer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: i64,
    pub role: Role,
}

impl Actor {
    pub fn new(id: i64, role: impl Into<String>) -> Self {
        Self {
            id,
            role: Role::new(role),
        }
    }
}

/// Everything one guarded delete needs. The statements are prepared by the
/// screen that owns the subject table and already carry their parameters.
#[derive(Debug, Clone)]
pub struct GuardedDeleteRequest {
    pub subject_id: i64,
    pub actor: Actor,
    /// Must yield the number of dependents in a blocking status as its first column
    pub dependents_check: Query,
    /// Marks the subject inactive. Zero affected rows means not found.
    pub primary_mutation: Query,
    pub cascade_mutation: Query,
    /// Resets the key generator when a duplicate-sequence failure is detected
    pub sequence_repair: Option<Query>,
}

impl GuardedDeleteRequest {
    pub fn new(
        subject_id: i64,
        actor: Actor,
        dependents_check: Query,
        primary_mutation: Query,
        cascade_mutation: Query,
    ) -> Self {
        Self {
            subject_id,
            actor,
            dependents_check,
            primary_mutation,
            cascade_mutation,
            sequence_repair: None,
        }
    }

    pub fn with_sequence_repair(mut self, repair: Query) -> Self {
        self.sequence_repair = Some(repair);
        self
    }
}

/// States of a guarded delete run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowState {
    Start,
    CheckDependents,
    PolicyDenied,
    ConfirmSimple,
    ConfirmCascade,
    ApplyPrimaryMutation,
    CascadeDependents,
    Commit,
    Rollback,
    RepairSequence,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Branch {
    Simple,
    Cascade,
}

impl Branch {
    pub fn confirm_state(self) -> WorkflowState {
        match self {
            Branch::Simple => WorkflowState::ConfirmSimple,
            Branch::Cascade => WorkflowState::ConfirmCascade,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    Committed,
    RolledBack,
    /// Ended before any transaction was opened: denied, declined or withdrawn
    Abandoned,
}

/// What the actor is asked to confirm before anything is mutated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationPrompt {
    pub subject_id: i64,
    pub dependents: u64,
    pub cascade: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted_subject_id: i64,
    pub cascaded: bool,
    pub dependents_closed: u64,
}

/// Per-run state of a guarded delete. Never shared between runs.
#[derive(Debug)]
pub struct WorkflowContext {
    pub run_id: RunId,
    pub subject_id: i64,
    pub actor_id: i64,
    pub actor_role: Role,
    pub dependents: Option<u64>,
    pub branch: Option<Branch>,
    pub resolution: Option<Resolution>,
    pub busy: bool,
    state: WorkflowState,
    trail: Vec<WorkflowState>,
    events: Option<EventEmitter>,
}

impl WorkflowContext {
    pub fn new(request: &GuardedDeleteRequest) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            subject_id: request.subject_id,
            actor_id: request.actor.id,
            actor_role: request.actor.role.clone(),
            dependents: None,
            branch: None,
            resolution: None,
            busy: true,
            state: WorkflowState::Start,
            trail: vec![WorkflowState::Start],
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    /// Every state entered so far, in order
    pub fn trail(&self) -> &[WorkflowState] {
        &self.trail
    }

    pub fn enter(&mut self, state: WorkflowState) {
        tracing::debug!(
            run_id = %self.run_id,
            subject_id = self.subject_id,
            from = ?self.state,
            to = ?state,
            "workflow transition"
        );
        self.state = state;
        self.trail.push(state);
        if let Some(events) = &self.events {
            events.transition(self.subject_id, state);
        }
    }

    pub fn finish(&mut self, resolution: Resolution) {
        self.resolution = Some(resolution);
        self.busy = false;
        self.enter(WorkflowState::End);
    }

    pub fn prompt(&self) -> Option<ConfirmationPrompt> {
        let branch = self.branch?;
        Some(ConfirmationPrompt {
            subject_id: self.subject_id,
            dependents: self.dependents.unwrap_or(0),
            cascade: branch == Branch::Cascade,
        })
    }
}
