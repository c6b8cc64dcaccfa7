//! Wire model for the parent ↔ worker protocol.
//!
//! One request frame per task, exactly one response frame per request.
//! Frames are correlated by [`MsgId`]; ids are allocated from a process-wide
//! counter, so a response can be routed without knowing which worker it came
//! from.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Correlates a request with its response.
pub type MsgId = u64;

static NEXT_MSG_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-unique message id.
///
/// Callers that need per-worker monotonicity (frame order == id order)
/// must allocate while holding the worker's write lock.
pub(crate) fn next_msg_id() -> MsgId {
    NEXT_MSG_ID.fetch_add(1, Ordering::Relaxed)
}

/// What the worker should execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskTarget {
    /// A task registered by name on the worker side.
    ///
    /// The worker resolves the name in its [`TaskRegistry`] and runs the
    /// handler with the request's argument payload. This is the portable
    /// form: captured state must travel in the arguments.
    ///
    /// [`TaskRegistry`]: crate::runner::TaskRegistry
    Named(String),

    /// An opaque callable blob.
    ///
    /// Rust cannot serialize closures; what (if anything) a blob decodes to
    /// is defined by the worker's runner. The default registry rejects blobs
    /// unless a resolver has been installed.
    Callable(Vec<u8>),
}

impl From<&str> for TaskTarget {
    fn from(name: &str) -> Self {
        TaskTarget::Named(name.to_owned())
    }
}

impl From<String> for TaskTarget {
    fn from(name: String) -> Self {
        TaskTarget::Named(name)
    }
}

/// Outbound frame payload: one task for the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: MsgId,
    pub target: TaskTarget,
    /// Argument payload, encoded at the submission boundary.
    pub args: Vec<u8>,
}

/// Inbound frame payload: the worker's verdict on one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub id: MsgId,
    pub outcome: Outcome,
}

/// Task outcome as reported by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Outcome {
    /// Encoded return value.
    Ok(Vec<u8>),
    /// Remote failure; `message` is the error or panic text, `trace` an
    /// optional remote stack string.
    Err { message: String, trace: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_ids_unique_and_increasing() {
        let a = next_msg_id();
        let b = next_msg_id();
        assert!(b > a);
    }

    #[test]
    fn test_target_from_str() {
        let t: TaskTarget = "double".into();
        assert_eq!(t, TaskTarget::Named("double".to_owned()));
    }
}
