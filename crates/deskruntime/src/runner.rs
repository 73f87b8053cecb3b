use crate::audit::AuditSink;
use crate::executor::{CallHandle, SubmitOptions, TaskExecutor};
use crate::workflow::GuardedDelete;
use deskcore::{
    Branch, ConfirmationPrompt, DeleteResult, ErrorInfo, EventBus, GuardedDeleteRequest,
    Resolution, RunId, WorkflowContext, WorkflowError,
};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Work handed from a worker back to the presentation thread between phases
struct Stage<T> {
    ctx: WorkflowContext,
    request: GuardedDeleteRequest,
    result: Result<T, WorkflowError>,
}

/// The caller's two handlers; whichever fires first consumes both
struct Reply<S, E> {
    slot: RefCell<Option<(S, E)>>,
}

impl<S, E> Reply<S, E>
where
    S: FnOnce(DeleteResult),
    E: FnOnce(ErrorInfo),
{
    fn new(on_success: S, on_error: E) -> Rc<Self> {
        Rc::new(Self {
            slot: RefCell::new(Some((on_success, on_error))),
        })
    }

    fn succeed(&self, result: DeleteResult) {
        let handlers = self.slot.borrow_mut().take();
        if let Some((on_success, _)) = handlers {
            on_success(result);
        }
    }

    fn fail(&self, error: ErrorInfo) {
        let handlers = self.slot.borrow_mut().take();
        if let Some((_, on_error)) = handlers {
            on_error(error);
        }
    }
}

/// Handle to one guarded delete run, across both of its phases
pub struct WorkflowHandle {
    run_id: RunId,
    withdrawn: Rc<Cell<bool>>,
    current: Rc<RefCell<Option<CallHandle>>>,
}

impl WorkflowHandle {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_pending(&self) -> bool {
        self.current
            .borrow()
            .as_ref()
            .is_some_and(CallHandle::is_pending)
    }

    /// Withdraw interest in the run. Returns true if a delivery was prevented.
    ///
    /// A transaction that is already running is not interrupted; it commits
    /// or rolls back on its own and the result is dropped.
    pub fn cancel(&self) -> bool {
        self.withdrawn.set(true);
        let current = self.current.borrow_mut().take();
        current.is_some_and(|call| call.cancel())
    }
}

/// Drives a guarded delete through the executor: assess on a worker,
/// confirm on the presentation thread, apply on a worker, then audit.
#[derive(Clone)]
pub struct GuardedDeleteRunner {
    executor: TaskExecutor,
    engine: Arc<GuardedDelete>,
    audit: Option<AuditSink>,
    audit_action: Cow<'static, str>,
    events: EventBus,
}

impl GuardedDeleteRunner {
    pub fn new(executor: TaskExecutor, engine: Arc<GuardedDelete>) -> Self {
        let events = executor.events().clone();
        Self {
            executor,
            engine,
            audit: None,
            audit_action: Cow::Borrowed("subject.deactivate"),
            events,
        }
    }

    pub fn with_audit(mut self, audit: AuditSink, action: impl Into<Cow<'static, str>>) -> Self {
        self.audit = Some(audit);
        self.audit_action = action.into();
        self
    }

    pub fn engine(&self) -> &Arc<GuardedDelete> {
        &self.engine
    }

    /// Start a guarded delete.
    ///
    /// `confirm` runs on the presentation thread once the blast radius is
    /// known. Returning false ends the run as cancelled: neither handler
    /// fires. Otherwise exactly one of `on_success` and `on_error` fires,
    /// unless the run is cancelled through the returned handle.
    pub fn run<C, S, E>(
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
        let ctx = WorkflowContext::new(&request);
        let run_id = ctx.run_id;
        let ctx = ctx.with_events(self.events.create_emitter(run_id));
        let handle = WorkflowHandle {
            run_id,
            withdrawn: Rc::new(Cell::new(false)),
            current: Rc::new(RefCell::new(None)),
        };

        tracing::info!(
            "Guarded delete of subject {} requested by actor {} ({})",
            request.subject_id,
            request.actor.id,
            request.actor.role
        );

        let reply = Reply::new(on_success, on_error);
        let engine = self.engine.clone();
        let runner = self.clone();
        let withdrawn = handle.withdrawn.clone();
        let current = handle.current.clone();
        let failed = reply.clone();

        let call = self.executor.submit_with(
            SubmitOptions::new("guarded delete: assess"),
            move |_| {
                let mut ctx = ctx;
                let result = engine.assess(&mut ctx, &request);
                Ok(Stage {
                    ctx,
                    request,
                    result,
                })
            },
            move |stage: Stage<Branch>| runner.confirm_and_apply(stage, confirm, withdrawn, current, reply),
            move |err| failed.fail(err),
        );
        *handle.current.borrow_mut() = Some(call);
        handle
    }

    fn confirm_and_apply<C, S, E>(
        &self,
        stage: Stage<Branch>,
        confirm: C,
        withdrawn: Rc<Cell<bool>>,
        current: Rc<RefCell<Option<CallHandle>>>,
        reply: Rc<Reply<S, E>>,
    ) where
        C: FnOnce(&ConfirmationPrompt) -> bool,
        S: FnOnce(DeleteResult) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        let Stage {
            mut ctx,
            request,
            result,
        } = stage;

        let branch = match result {
            Ok(branch) => branch,
            Err(e) => return reply.fail(e.into()),
        };

        let prompt = ConfirmationPrompt {
            subject_id: request.subject_id,
            dependents: ctx.dependents.unwrap_or(0),
            cascade: branch == Branch::Cascade,
        };
        if withdrawn.get() || !confirm(&prompt) {
            ctx.finish(Resolution::Abandoned);
            tracing::info!("Guarded delete of subject {} was not confirmed", request.subject_id);
            return;
        }

        let engine = self.engine.clone();
        let audit = self.audit.clone();
        let action = self.audit_action.clone();
        let failed = reply.clone();

        let call = self.executor.submit_with(
            SubmitOptions::new("guarded delete: apply"),
            move |_| {
                let mut ctx = ctx;
                let result = engine.apply(&mut ctx, &request, Some(&prompt));
                Ok(Stage {
                    ctx,
                    request,
                    result,
                })
            },
            move |stage: Stage<DeleteResult>| match stage.result {
                Ok(result) => {
                    let details = format!(
                        "subject {} deactivated, {} dependent(s) closed",
                        result.deleted_subject_id, result.dependents_closed
                    );
                    let actor_id = stage.request.actor.id;
                    reply.succeed(result);
                    if let Some(audit) = audit {
                        audit.record(actor_id, action, details);
                    }
                }
                Err(e) => reply.fail(e.into()),
            },
            move |err| failed.fail(err),
        );
        *current.borrow_mut() = Some(call);
    }
}
