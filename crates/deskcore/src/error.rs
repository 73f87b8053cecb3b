use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeskError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Structured code attached to a storage failure by stores that provide one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorCode {
    /// A generated key collided with an existing primary key
    DuplicateKey,
    UniqueViolation,
    Constraint,
    /// Engine-specific code with no portable meaning
    Engine(i32),
}

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Connection unavailable: {0}")]
    Connection(String),

    #[error("Timed out after {millis}ms")]
    Timeout { millis: u64 },

    #[error("{message}")]
    Storage {
        code: Option<StoreErrorCode>,
        message: String,
    },
}

impl StoreError {
    pub fn storage(message: impl Into<String>) -> Self {
        StoreError::Storage {
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(code: StoreErrorCode, message: impl Into<String>) -> Self {
        StoreError::Storage {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Connection(_) => ErrorKind::Connection,
            StoreError::Timeout { .. } => ErrorKind::Timeout,
            StoreError::Storage { .. } => ErrorKind::Storage,
        }
    }
}

/// Errors raised by a task running on a worker
#[derive(Error, Debug)]
pub enum TaskError {
    /// The task observed a cancellation request and stopped early
    #[error("Task interrupted")]
    Interrupted,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            TaskError::Interrupted | TaskError::Failed(_) => None,
            TaskError::Store(e) => Some(e.kind()),
            TaskError::Workflow(e) => Some(e.kind()),
        }
    }
}

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Actor {actor_id} ({role}) may not delete subject {subject_id}: {dependents} dependent record(s) are still open")]
    Forbidden {
        subject_id: i64,
        actor_id: i64,
        role: String,
        dependents: u64,
    },

    #[error("Subject {subject_id} was not found or is already inactive")]
    NotFound { subject_id: i64 },

    #[error("Sequence conflict while deleting subject {subject_id} was repaired, try again")]
    TransientConflict {
        subject_id: i64,
        #[source]
        source: StoreError,
    },

    #[error("Dependents of subject {subject_id} changed since confirmation ({confirmed} confirmed, {found} found)")]
    DependentsChanged {
        subject_id: i64,
        confirmed: u64,
        found: u64,
    },

    #[error("Sequence repair failed after '{original}': {source}")]
    RepairFailed {
        original: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Forbidden { .. } => ErrorKind::Forbidden,
            WorkflowError::NotFound { .. } => ErrorKind::NotFound,
            WorkflowError::TransientConflict { .. } | WorkflowError::DependentsChanged { .. } => {
                ErrorKind::TransientConflict
            }
            WorkflowError::RepairFailed { .. } => ErrorKind::Storage,
            WorkflowError::Store(e) => e.kind(),
        }
    }
}

/// Classification tag carried by a failed outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Timeout,
    Forbidden,
    NotFound,
    TransientConflict,
    Storage,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::TransientConflict => "TransientConflict",
            ErrorKind::Storage => "StorageError",
        };
        f.write_str(name)
    }
}

/// Error delivered to a failure handler.
///
/// Keeps the original error as its source so diagnostics can walk the
/// whole chain.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub kind: Option<ErrorKind>,
    pub message: String,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ErrorInfo {
    pub fn new(kind: Option<ErrorKind>, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn timeout(millis: u64) -> Self {
        Self::from(StoreError::Timeout { millis })
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == Some(kind)
    }

    /// Only transient conflicts are worth an immediate retry
    pub fn is_retryable(&self) -> bool {
        self.is_kind(ErrorKind::TransientConflict)
    }

    /// Text suitable for showing to the person who triggered the action
    pub fn user_message(&self) -> String {
        match self.kind {
            Some(ErrorKind::Forbidden) | Some(ErrorKind::NotFound) => self.message.clone(),
            Some(ErrorKind::TransientConflict) => {
                "The record was busy or out of sync. Please try again.".to_string()
            }
            _ => format!("The operation failed: {}", self.message),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{}: {}", kind, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<TaskError> for ErrorInfo {
    fn from(err: TaskError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }
}

impl From<StoreError> for ErrorInfo {
    fn from(err: StoreError) -> Self {
        TaskError::Store(err).into()
    }
}

impl From<WorkflowError> for ErrorInfo {
    fn from(err: WorkflowError) -> Self {
        TaskError::Workflow(err).into()
    }
}
