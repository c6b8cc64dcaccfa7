//! Error types for the task pool.
//!
//! One public [`Error`] enum covers everything a submitter can observe.
//! Errors raised before a worker is bound (validation, `PoolStopped`,
//! `CheckoutTimeout`) are side-effect free; errors raised after a send has
//! been accepted only surface once the worker has been checked back in or
//! killed.

use std::time::Duration;

use crate::codec::CodecError;
use crate::proto::MsgId;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the task pool.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A submission argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Submission arrived while the pool was shutting down.
    #[error("pool is not running")]
    PoolStopped,

    /// No worker became available within the acquire timeout.
    #[error("no worker available within {0:?}")]
    CheckoutTimeout(Duration),

    /// The worker evaluated the task and reported failure.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The worker exited or its pipes closed before replying.
    #[error("worker died: {0}")]
    WorkerDead(String),

    /// A message id was collected that the pending table has no record of.
    #[error("unknown message id {0}")]
    UnknownMsgId(MsgId),

    /// Wire encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The worker child process could not be started.
    #[error("failed to spawn worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The current platform cannot attach non-blocking pipes to children.
    #[error("unsupported platform: {0}")]
    Unsupported(&'static str),
}

/// A task failure reported by a worker over the wire.
///
/// `message` carries the remote error or panic text; `trace` is an optional
/// remote backtrace-like string, preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task failed: {message}")]
pub struct TaskError {
    pub message: String,
    pub trace: Option<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        TaskError { message: message.into(), trace: None }
    }

    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        TaskError { message: message.into(), trace: Some(trace.into()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = Error::PoolStopped;
        assert_eq!(format!("{}", e), "pool is not running");

        let e = Error::CheckoutTimeout(Duration::from_millis(250));
        assert_eq!(format!("{}", e), "no worker available within 250ms");

        let e = Error::Task(TaskError::new("division by zero"));
        assert_eq!(format!("{}", e), "task failed: division by zero");
    }

    #[test]
    fn test_task_error_conversion() {
        let task_err = TaskError::with_trace("boom", "at line 3");
        let err: Error = task_err.clone().into();
        assert!(matches!(err, Error::Task(t) if t == task_err));
    }
}
