//! Guarded soft-delete of a subject that may own dependent records.
//!
//! The run is split in two so the actor can confirm the real blast radius:
//! [`GuardedDelete::assess`] checks dependents and the role policy without
//! touching anything, and [`GuardedDelete::apply`] re-checks, mutates,
//! cascades and commits inside one transaction. Any failure in `apply` is
//! rolled back before it is classified.
//!
//! With a timeout set, each phase runs against a deadline enforced on the
//! worker itself: the connection is asked to interrupt statements that run
//! past it, and the deadline is checked again between steps. An expired
//! deadline is rolled back like any other failure, so a run that reported
//! a timeout never commits afterwards.

use crate::query::count_rows;
use deskcore::{
    Branch, ConfirmationPrompt, Connection, DataStore, Deadline, DeleteResult,
    GuardedDeleteRequest, Resolution, Role, StoreError, StoreErrorCode, WorkflowContext,
    WorkflowError, WorkflowState,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Message fragments that identify a duplicate generated key when the store
/// gives no structured error code
const DUPLICATE_SEQUENCE_SIGNATURES: [&str; 2] = ["already exists", "duplicate key"];

/// Whether a storage failure was caused by a drifted key generator
pub fn is_duplicate_sequence(err: &StoreError) -> bool {
    match err {
        StoreError::Storage {
            code: Some(code), ..
        } => *code == StoreErrorCode::DuplicateKey,
        StoreError::Storage {
            code: None,
            message,
        } => {
            let message = message.to_lowercase();
            DUPLICATE_SEQUENCE_SIGNATURES
                .iter()
                .any(|signature| message.contains(signature))
        }
        _ => false,
    }
}

/// Roles allowed to delete a subject that still has blocking dependents
#[derive(Debug, Clone)]
pub struct OverridePolicy {
    roles: HashSet<Role>,
}

impl OverridePolicy {
    pub fn new<I, R>(roles: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Role::new).collect(),
        }
    }

    pub fn can_override(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }
}

impl Default for OverridePolicy {
    fn default() -> Self {
        Self::new(["admin"])
    }
}

fn on_time(deadline: Option<Deadline>) -> Result<(), StoreError> {
    deadline.map_or(Ok(()), |deadline| deadline.check())
}

pub struct GuardedDelete {
    store: Arc<dyn DataStore>,
    policy: OverridePolicy,
    timeout: Option<Duration>,
}

impl GuardedDelete {
    pub fn new(store: Arc<dyn DataStore>, policy: OverridePolicy) -> Self {
        Self {
            store,
            policy,
            timeout: None,
        }
    }

    /// Bound each phase, `assess` and `apply` separately
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn policy(&self) -> &OverridePolicy {
        &self.policy
    }

    /// Check dependents and the policy gate. Nothing is mutated.
    ///
    /// On success the context sits in `ConfirmSimple` or `ConfirmCascade`
    /// and [`WorkflowContext::prompt`] describes what to confirm.
    pub fn assess(
        &self,
        ctx: &mut WorkflowContext,
        request: &GuardedDeleteRequest,
    ) -> Result<Branch, WorkflowError> {
        let deadline = self.timeout.map(Deadline::after);
        let checked = self
            .store
            .acquire()
            .map_err(WorkflowError::from)
            .and_then(|mut conn| {
                conn.set_deadline(deadline);
                self.check(conn.as_mut(), ctx, request, deadline)
            });

        match checked {
            Ok(branch) => {
                ctx.enter(branch.confirm_state());
                Ok(branch)
            }
            Err(e) => {
                ctx.finish(Resolution::Abandoned);
                tracing::info!("Guarded delete of subject {} stopped: {}", request.subject_id, e);
                Err(e)
            }
        }
    }

    /// Re-check, mutate, cascade and commit as one unit.
    ///
    /// With a prompt, the run fails with `DependentsChanged` if the re-check
    /// disagrees with what the actor confirmed. Without one, the caller
    /// confirmed up front and whatever branch the gate allows is taken.
    pub fn apply(
        &self,
        ctx: &mut WorkflowContext,
        request: &GuardedDeleteRequest,
        confirmed: Option<&ConfirmationPrompt>,
    ) -> Result<DeleteResult, WorkflowError> {
        let deadline = self.timeout.map(Deadline::after);
        let mut conn = match self.store.acquire() {
            Ok(conn) => conn,
            Err(e) => {
                ctx.finish(Resolution::Abandoned);
                return Err(e.into());
            }
        };
        let conn = conn.as_mut();
        conn.set_deadline(deadline);

        if let Err(e) = conn.begin() {
            ctx.finish(Resolution::Abandoned);
            return Err(e.into());
        }

        let result = match self.mutate(conn, ctx, request, confirmed, deadline) {
            Ok(result) => {
                ctx.enter(WorkflowState::Commit);
                conn.commit().map(|()| result).map_err(WorkflowError::from)
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(result) => {
                ctx.finish(Resolution::Committed);
                tracing::info!(
                    "Subject {} deactivated by actor {} (cascaded: {}, dependents closed: {})",
                    result.deleted_subject_id,
                    request.actor.id,
                    result.cascaded,
                    result.dependents_closed
                );
                Ok(result)
            }
            Err(e) => Err(self.fail(conn, ctx, request, e)),
        }
    }

    fn check(
        &self,
        conn: &mut dyn Connection,
        ctx: &mut WorkflowContext,
        request: &GuardedDeleteRequest,
        deadline: Option<Deadline>,
    ) -> Result<Branch, WorkflowError> {
        ctx.enter(WorkflowState::CheckDependents);
        let count = count_rows(conn, &request.dependents_check)?;
        on_time(deadline)?;
        let dependents = u64::try_from(count).map_err(|_| {
            StoreError::storage(format!(
                "'{}' returned a negative count: {}",
                request.dependents_check, count
            ))
        })?;
        ctx.dependents = Some(dependents);

        let branch = if dependents == 0 {
            Branch::Simple
        } else if self.policy.can_override(&request.actor.role) {
            Branch::Cascade
        } else {
            ctx.enter(WorkflowState::PolicyDenied);
            return Err(WorkflowError::Forbidden {
                subject_id: request.subject_id,
                actor_id: request.actor.id,
                role: request.actor.role.to_string(),
                dependents,
            });
        };

        ctx.branch = Some(branch);
        Ok(branch)
    }

    fn mutate(
        &self,
        conn: &mut dyn Connection,
        ctx: &mut WorkflowContext,
        request: &GuardedDeleteRequest,
        confirmed: Option<&ConfirmationPrompt>,
        deadline: Option<Deadline>,
    ) -> Result<DeleteResult, WorkflowError> {
        on_time(deadline)?;
        let branch = self.check(conn, ctx, request, deadline)?;
        let cascade = branch == Branch::Cascade;
        let found = ctx.dependents.unwrap_or(0);

        match confirmed {
            Some(prompt) if prompt.dependents != found || prompt.cascade != cascade => {
                return Err(WorkflowError::DependentsChanged {
                    subject_id: request.subject_id,
                    confirmed: prompt.dependents,
                    found,
                });
            }
            Some(_) => {}
            None => ctx.enter(branch.confirm_state()),
        }

        ctx.enter(WorkflowState::ApplyPrimaryMutation);
        let affected = conn.execute(&request.primary_mutation)?;
        on_time(deadline)?;
        if affected == 0 {
            return Err(WorkflowError::NotFound {
                subject_id: request.subject_id,
            });
        }

        let mut dependents_closed = 0;
        if cascade {
            ctx.enter(WorkflowState::CascadeDependents);
            dependents_closed = conn.execute(&request.cascade_mutation)?;
            on_time(deadline)?;
            if dependents_closed == 0 {
                tracing::warn!(
                    "Cascade for subject {} closed no dependents ({} were counted)",
                    request.subject_id,
                    found
                );
            }
        }

        Ok(DeleteResult {
            deleted_subject_id: request.subject_id,
            cascaded: cascade,
            dependents_closed,
        })
    }

    /// Roll back, then classify. A duplicate-sequence failure gets one repair attempt.
    fn fail(
        &self,
        conn: &mut dyn Connection,
        ctx: &mut WorkflowContext,
        request: &GuardedDeleteRequest,
        error: WorkflowError,
    ) -> WorkflowError {
        ctx.enter(WorkflowState::Rollback);
        conn.set_deadline(None);
        if let Err(e) = conn.rollback() {
            tracing::error!("Rollback for subject {} failed: {}", request.subject_id, e);
        }

        let error = match error {
            WorkflowError::Store(cause) if is_duplicate_sequence(&cause) => {
                self.repair(conn, ctx, request, cause)
            }
            other => other,
        };

        ctx.finish(Resolution::RolledBack);
        tracing::warn!("Guarded delete of subject {} rolled back: {}", request.subject_id, error);
        error
    }

    fn repair(
        &self,
        conn: &mut dyn Connection,
        ctx: &mut WorkflowContext,
        request: &GuardedDeleteRequest,
        cause: StoreError,
    ) -> WorkflowError {
        let Some(statement) = &request.sequence_repair else {
            tracing::warn!(
                "Duplicate sequence value on subject {} but no repair statement is configured",
                request.subject_id
            );
            return WorkflowError::Store(cause);
        };

        ctx.enter(WorkflowState::RepairSequence);
        match conn.execute(statement) {
            Ok(_) => {
                tracing::warn!("Key sequence repaired after: {}", cause);
                WorkflowError::TransientConflict {
                    subject_id: request.subject_id,
                    source: cause,
                }
            }
            Err(e) => {
                tracing::error!("Key sequence repair failed: {}", e);
                WorkflowError::RepairFailed {
                    original: cause.to_string(),
                    source: e,
                }
            }
        }
    }
}
