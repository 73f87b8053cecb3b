use crate::{ErrorInfo, TaskError};
use serde::{Deserialize, Serialize};

/// Result of one submitted task
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    Success(T),
    Failure(ErrorInfo),
    /// Interest was withdrawn. The task may still have run; its result is discarded.
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success(_) => OutcomeKind::Success,
            Outcome::Failure(_) => OutcomeKind::Failure,
            Outcome::Cancelled => OutcomeKind::Cancelled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(v) => Outcome::Success(f(v)),
            Outcome::Failure(e) => Outcome::Failure(e),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        match self {
            Outcome::Failure(e) => Some(e),
            _ => None,
        }
    }
}

impl<T> From<Result<T, TaskError>> for Outcome<T> {
    /// An interrupted task is cancelled, not failed
    fn from(result: Result<T, TaskError>) -> Self {
        match result {
            Ok(v) => Outcome::Success(v),
            Err(TaskError::Interrupted) => Outcome::Cancelled,
            Err(e) => Outcome::Failure(e.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Success,
    Failure,
    Cancelled,
}
