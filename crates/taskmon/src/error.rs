//! Error types for the taskmon coordination framework

use std::time::Duration;

use thiserror::Error;

use crate::status::Status;

/// Main error type for taskmon operations
#[derive(Error, Debug, Clone)]
pub enum TaskmonError {
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Sequence error: {0}")]
    Sequence(#[from] SequenceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised when submitting work to a dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatcher {name} rejected the job: it is shut down")]
    Rejected { name: String },

    #[error("Dispatcher thread could not be started: {reason}")]
    SpawnFailed { reason: String },
}

/// Errors returned when waiting on a [`Query`](crate::query::Query) or a
/// [`SequenceHandle`](crate::sequence::SequenceHandle)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Request was cancelled")]
    Cancelled,

    #[error("Request failed: {0}")]
    Failed(Status),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Blocking wait called on the dispatcher thread")]
    WouldDeadlock,
}

/// Errors related to building sequences from named steps
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    #[error("Unknown step or group: {name}")]
    UnknownName { name: String },

    #[error("Name registered twice: {name}")]
    DuplicateName { name: String },

    #[error("Group {name} includes itself")]
    GroupCycle { name: String },
}

/// Errors related to configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid thread name: must not be empty")]
    EmptyThreadName,

    #[error("Invalid timeout duration: {duration:?} (must be > 0)")]
    InvalidTimeout { duration: Duration },
}

/// Result type alias for taskmon operations
pub type TaskmonResult<T> = Result<T, TaskmonError>;

/// Result type alias for dispatcher submissions
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Result type alias for blocking waits
pub type QueryResult<T> = Result<T, QueryError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

impl DispatchError {
    /// Create a rejection error for the named dispatcher
    pub fn rejected<S: Into<String>>(name: S) -> Self {
        DispatchError::Rejected { name: name.into() }
    }

    /// The dispatcher thread could not be started
    pub fn spawn_failed<S: Into<String>>(reason: S) -> Self {
        DispatchError::SpawnFailed { reason: reason.into() }
    }
}

impl QueryError {
    /// Derive the wait error from a terminal status that was not a success
    pub fn from_status(status: Status) -> Self {
        if status.is_cancel() {
            QueryError::Cancelled
        } else {
            QueryError::Failed(status)
        }
    }

    /// Check if this error indicates cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled)
    }

    /// Check if this error indicates a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::Timeout(_))
    }

    /// The failed status, if the request completed with an error
    pub fn status(&self) -> Option<&Status> {
        match self {
            QueryError::Failed(status) => Some(status),
            _ => None,
        }
    }
}

impl SequenceError {
    /// No step or group is registered under `name`
    pub fn unknown<S: Into<String>>(name: S) -> Self {
        SequenceError::UnknownName { name: name.into() }
    }

    /// `name` is registered twice or reached twice while resolving
    pub fn duplicate<S: Into<String>>(name: S) -> Self {
        SequenceError::DuplicateName { name: name.into() }
    }

    /// Group `name` contains itself
    pub fn cycle<S: Into<String>>(name: S) -> Self {
        SequenceError::GroupCycle { name: name.into() }
    }
}

impl ConfigError {
    /// Create an invalid timeout error
    pub fn invalid_timeout(duration: Duration) -> Self {
        ConfigError::InvalidTimeout { duration }
    }
}

impl TaskmonError {
    /// Check if this error indicates cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskmonError::Query(QueryError::Cancelled))
    }
}
