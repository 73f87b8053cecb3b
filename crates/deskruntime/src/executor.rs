use chrono::Utc;
use deskcore::{
    CallId, DeskError, ErrorInfo, EventBus, Outcome, OutcomeKind, TaskError, TaskEvent,
};
use std::any::Any;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

type AnyValue = Box<dyn Any + Send>;
type Deliver = Box<dyn FnOnce(Outcome<AnyValue>)>;

/// Result posted back from a worker
struct Completion {
    call_id: CallId,
    outcome: Outcome<AnyValue>,
}

/// Handlers waiting for one submitted task
struct PendingCall {
    label: Cow<'static, str>,
    deliver: Deliver,
}

/// Per-submission options
#[derive(Debug, Clone)]
pub struct SubmitOptions {
    label: Cow<'static, str>,
    timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn new(label: impl Into<Cow<'static, str>>) -> Self {
        Self {
            label: label.into(),
            timeout: None,
        }
    }

    /// Fail the call with a timeout if the task has not finished in time.
    /// The worker keeps running; its late result is dropped.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl Default for SubmitOptions {
    fn default() -> Self {
        Self::new("task")
    }
}

struct Shared {
    handle: Handle,
    sender: mpsc::UnboundedSender<Completion>,
    pending: RefCell<HashMap<CallId, PendingCall>>,
    next_id: Cell<CallId>,
    busy: Cell<bool>,
    busy_listener: RefCell<Option<Box<dyn FnMut(bool)>>>,
    events: EventBus,
}

impl Shared {
    fn has_pending(&self) -> bool {
        !self.pending.borrow().is_empty()
    }

    fn is_waiting(&self, call_id: CallId) -> bool {
        self.pending.borrow().contains_key(&call_id)
    }

    fn take_pending(&self, call_id: CallId) -> Option<PendingCall> {
        self.pending.borrow_mut().remove(&call_id)
    }

    /// Report idle/busy edges to the listener
    fn refresh_busy(&self) {
        let busy = self.has_pending();
        if busy == self.busy.get() {
            return;
        }
        self.busy.set(busy);
        self.events.emit(TaskEvent::BusyChanged {
            busy,
            timestamp: Utc::now(),
        });

        // The listener may submit work, so it must not be borrowed while it runs
        let listener = self.busy_listener.borrow_mut().take();
        if let Some(mut listener) = listener {
            listener(busy);
            let mut slot = self.busy_listener.borrow_mut();
            if slot.is_none() {
                *slot = Some(listener);
            }
        }
    }
}

/// Runs blocking tasks on worker threads and routes their outcomes back
/// to the presentation context.
///
/// The executor and its [`Presenter`] are not `Send`: both live on the
/// presentation thread, which is what keeps handler invocations serialized.
/// Tasks themselves run on the runtime's blocking pool.
#[derive(Clone)]
pub struct TaskExecutor {
    shared: Rc<Shared>,
}

impl TaskExecutor {
    pub fn new(handle: Handle, events: EventBus) -> (Self, Presenter) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Rc::new(Shared {
            handle,
            sender,
            pending: RefCell::new(HashMap::new()),
            next_id: Cell::new(1),
            busy: Cell::new(false),
            busy_listener: RefCell::new(None),
            events,
        });

        (
            Self {
                shared: shared.clone(),
            },
            Presenter { receiver, shared },
        )
    }

    /// Build an executor on the tokio runtime the caller is running in
    pub fn from_current(events: EventBus) -> Result<(Self, Presenter), DeskError> {
        let handle = Handle::try_current()
            .map_err(|e| DeskError::Runtime(format!("No tokio runtime available: {}", e)))?;
        Ok(Self::new(handle, events))
    }

    /// Register the callback told whenever the executor turns busy or idle
    pub fn on_busy_change(&self, listener: impl FnMut(bool) + 'static) {
        *self.shared.busy_listener.borrow_mut() = Some(Box::new(listener));
    }

    pub fn is_busy(&self) -> bool {
        self.shared.busy.get()
    }

    /// Number of calls still waiting for delivery
    pub fn pending(&self) -> usize {
        self.shared.pending.borrow().len()
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    /// Run `task` on a worker and deliver its outcome to exactly one of the handlers
    pub fn submit<T, F, S, E>(&self, task: F, on_success: S, on_error: E) -> CallHandle
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, TaskError> + Send + 'static,
        S: FnOnce(T) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        self.submit_with(SubmitOptions::default(), move |_| task(), on_success, on_error)
    }

    /// Like [`submit`](Self::submit), with options. The task receives the
    /// call's cancellation token and may return `TaskError::Interrupted`
    /// when it sees the token cancelled.
    pub fn submit_with<T, F, S, E>(
        &self,
        options: SubmitOptions,
        task: F,
        on_success: S,
        on_error: E,
    ) -> CallHandle
    where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, TaskError> + Send + 'static,
        S: FnOnce(T) + 'static,
        E: FnOnce(ErrorInfo) + 'static,
    {
        let call_id = self.shared.next_id.get();
        self.shared.next_id.set(call_id + 1);
        let token = CancellationToken::new();

        let deliver: Deliver = Box::new(move |outcome: Outcome<AnyValue>| match outcome {
            Outcome::Success(value) => match value.downcast::<T>() {
                Ok(value) => on_success(*value),
                Err(_) => on_error(ErrorInfo::new(
                    None,
                    "Task produced a value of an unexpected type",
                )),
            },
            Outcome::Failure(error) => on_error(error),
            Outcome::Cancelled => {}
        });

        self.shared.pending.borrow_mut().insert(
            call_id,
            PendingCall {
                label: options.label.clone(),
                deliver,
            },
        );

        tracing::debug!("Submitted task {} ({})", call_id, options.label);
        self.shared.events.emit(TaskEvent::Submitted {
            call_id,
            label: options.label.to_string(),
            timestamp: Utc::now(),
        });

        self.spawn_worker(call_id, options.timeout, token.clone(), task);
        self.shared.refresh_busy();

        CallHandle {
            call_id,
            token,
            shared: Rc::downgrade(&self.shared),
        }
    }

    fn spawn_worker<T, F>(
        &self,
        call_id: CallId,
        timeout: Option<Duration>,
        token: CancellationToken,
        task: F,
    ) where
        T: Send + 'static,
        F: FnOnce(&CancellationToken) -> Result<T, TaskError> + Send + 'static,
    {
        let sender = self.shared.sender.clone();
        let events = self.shared.events.clone();
        let handle = self.shared.handle.clone();

        self.shared.handle.spawn(async move {
            let start = Instant::now();
            let worker_token = token.clone();
            let join = handle.spawn_blocking(move || {
                if worker_token.is_cancelled() {
                    return Err(TaskError::Interrupted);
                }
                task(&worker_token).map(|value| Box::new(value) as AnyValue)
            });

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, join).await {
                    Ok(joined) => settle(joined),
                    Err(_) => {
                        token.cancel();
                        tracing::warn!("Task {} timed out after {}ms", call_id, limit.as_millis());
                        Outcome::Failure(ErrorInfo::timeout(limit.as_millis() as u64))
                    }
                },
                None => settle(join.await),
            };

            events.emit(TaskEvent::Completed {
                call_id,
                outcome: outcome.kind(),
                duration_ms: start.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });

            // Receiver gone means the presentation context shut down
            let _ = sender.send(Completion { call_id, outcome });
        });
    }
}

fn settle(joined: Result<Result<AnyValue, TaskError>, JoinError>) -> Outcome<AnyValue> {
    match joined {
        Ok(result) => result.into(),
        Err(e) if e.is_cancelled() => Outcome::Cancelled,
        Err(e) => Err::<AnyValue, _>(TaskError::Failed(format!("Task aborted: {}", e))).into(),
    }
}

/// What the presenter did with one completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A handler ran
    Delivered { call_id: CallId, outcome: OutcomeKind },
    /// The task interrupted itself; no handler ran
    Cancelled { call_id: CallId },
    /// Nobody was waiting any more (the call was cancelled through its handle)
    Discarded { call_id: CallId },
}

/// Drains completions on the presentation thread, one at a time, in
/// completion order.
pub struct Presenter {
    receiver: mpsc::UnboundedReceiver<Completion>,
    shared: Rc<Shared>,
}

impl Presenter {
    /// Deliver every completion that has already arrived, without waiting
    pub fn dispatch_ready(&mut self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        while let Ok(completion) = self.receiver.try_recv() {
            dispatched.push(self.deliver(completion));
        }
        dispatched
    }

    /// Wait for the next completion and deliver it
    pub async fn dispatch_next(&mut self) -> Option<Dispatch> {
        let completion = self.receiver.recv().await?;
        Some(self.deliver(completion))
    }

    /// Keep delivering until no call is waiting, including calls submitted
    /// by the handlers themselves
    pub async fn run_until_idle(&mut self) -> Vec<Dispatch> {
        let mut dispatched = Vec::new();
        while self.shared.has_pending() {
            match self.dispatch_next().await {
                Some(dispatch) => dispatched.push(dispatch),
                None => break,
            }
        }
        dispatched
    }

    fn deliver(&self, completion: Completion) -> Dispatch {
        let call_id = completion.call_id;
        let dispatch = match self.shared.take_pending(call_id) {
            None => {
                tracing::debug!("Discarding result of withdrawn task {}", call_id);
                self.shared.events.emit(TaskEvent::Discarded {
                    call_id,
                    timestamp: Utc::now(),
                });
                Dispatch::Discarded { call_id }
            }
            Some(call) => match completion.outcome {
                Outcome::Cancelled => {
                    tracing::info!("Task {} ({}) was interrupted", call_id, call.label);
                    self.shared.events.emit(TaskEvent::Discarded {
                        call_id,
                        timestamp: Utc::now(),
                    });
                    Dispatch::Cancelled { call_id }
                }
                outcome => {
                    let kind = outcome.kind();
                    if let Some(error) = outcome.error() {
                        tracing::debug!("Task {} ({}) failed: {}", call_id, call.label, error);
                    }
                    (call.deliver)(outcome);
                    self.shared.events.emit(TaskEvent::Delivered {
                        call_id,
                        outcome: kind,
                        timestamp: Utc::now(),
                    });
                    Dispatch::Delivered {
                        call_id,
                        outcome: kind,
                    }
                }
            },
        };
        self.shared.refresh_busy();
        dispatch
    }
}

/// Handle to one submitted call
pub struct CallHandle {
    call_id: CallId,
    token: CancellationToken,
    shared: Weak<Shared>,
}

impl CallHandle {
    pub fn id(&self) -> CallId {
        self.call_id
    }

    /// Whether the call is still waiting for delivery
    pub fn is_pending(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.is_waiting(self.call_id))
    }

    /// Withdraw interest. Returns true if this prevented a delivery.
    ///
    /// Side effects the task already performed are not undone.
    pub fn cancel(&self) -> bool {
        self.token.cancel();
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        match shared.take_pending(self.call_id) {
            Some(call) => {
                tracing::info!("Cancelled task {} ({})", self.call_id, call.label);
                drop(call);
                shared.refresh_busy();
                true
            }
            None => false,
        }
    }
}
