//! Core abstractions for clientdesk
//!
//! This crate provides the types and seams every other crate depends on:
//! the data store capability, task outcomes, the error taxonomy and the
//! guarded-delete workflow model. It does not run anything itself.

mod audit;
mod error;
pub mod events;
mod outcome;
mod store;
mod value;
mod workflow;

pub use audit::AuditEvent;
pub use error::{
    DeskError, ErrorInfo, ErrorKind, StoreError, StoreErrorCode, TaskError, WorkflowError,
};
pub use events::*;
pub use outcome::{Outcome, OutcomeKind};
pub use store::{Connection, DataStore, Deadline, Query, Row, RowSet};
pub use value::Value;
pub use workflow::{
    Actor, Branch, ConfirmationPrompt, DeleteResult, GuardedDeleteRequest, Resolution, Role,
    RunId, WorkflowContext, WorkflowState,
};

/// Result type for setup and configuration operations
pub type Result<T> = std::result::Result<T, DeskError>;
