//! Task execution runtime
//!
//! This crate runs blocking data store work off the presentation thread,
//! delivers outcomes back onto it, and builds the canned query shapes, the
//! audit sink and the guarded delete workflow on top of that.

mod audit;
mod executor;
mod query;
mod runner;
mod runtime;
mod workflow;

pub use audit::{AuditSink, AUDIT_INSERT};
pub use executor::{CallHandle, Dispatch, Presenter, SubmitOptions, TaskExecutor};
pub use query::{QueryAdapter, DEFAULT_QUERY_TIMEOUT};
pub use runner::{GuardedDeleteRunner, WorkflowHandle};
pub use runtime::{DeskRuntime, RuntimeConfig};
pub use workflow::{is_duplicate_sequence, GuardedDelete, OverridePolicy};

pub use tokio_util::sync::CancellationToken;
