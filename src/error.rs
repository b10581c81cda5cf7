use thiserror::Error;

use crate::model::{TaskId, TaskStatus, WorkerId};

pub type EngineResult<T> = Result<T, EngineError>;

/// The closed failure taxonomy for the engine. Every subsystem error converts
/// into one of these variants at its module boundary rather than leaking a
/// stringly-typed failure to callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("throttle rate {0} outside [0.1, 2.0]")]
    ThrottleOutOfRange(f64),

    #[error("task {0} depends on itself")]
    CyclicDependency(TaskId),

    #[error("subscription requested an empty channel set")]
    EmptyChannelSet,

    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("worker {0} not found")]
    WorkerNotFound(WorkerId),

    #[error("shared state store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("channel {0} is unknown")]
    UnknownChannel(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        EngineError::StoreUnavailable(err.to_string())
    }
}

/// Narrower error type for the state-store adapter; converts into
/// `EngineError` at the module boundary the same way the rest of the engine's
/// subsystem errors do.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serde(err.to_string())
    }
}
