//! Worker-side task evaluation.
//!
//! The serve loop in [`entry`](crate::entry) hands each decoded request to a
//! [`TaskRunner`]. The stock implementation is [`TaskRegistry`]: a table of
//! named handlers over encoded payloads, with typed registration sugar.
//!
//! Closures do not survive serialization in Rust, so the portable way to
//! ship work is a registered name plus encoded arguments. A registry can
//! opt into [`TaskTarget::Callable`] blobs by installing a resolver that
//! knows how to interpret them.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec;
use crate::proto::TaskTarget;

/// A task failure produced on the worker side.
///
/// Travels back to the submitter as the wire `Err` outcome and surfaces
/// there as a `TaskError`.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub message: String,
    pub trace: Option<String>,
}

impl TaskFailure {
    pub fn msg(message: impl Into<String>) -> Self {
        TaskFailure { message: message.into(), trace: None }
    }

    pub fn with_trace(message: impl Into<String>, trace: impl Into<String>) -> Self {
        TaskFailure { message: message.into(), trace: Some(trace.into()) }
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Evaluates one task per call.
///
/// **Contract:**
/// - `run` is invoked once per request, serially, on the worker process.
/// - The returned bytes are the encoded task value; the caller wraps them
///   into the response envelope.
/// - Panics need not be handled here; the serve loop catches them and
///   reports the panic message as a failure.
pub trait TaskRunner: Send + Sync {
    fn run(&self, target: &TaskTarget, args: &[u8]) -> Result<Vec<u8>, TaskFailure>;
}

/// A task with constructor + run semantics, addressable by name.
///
/// The registered handler decodes `Args`, builds the task, runs it, and
/// encodes the output. Useful when setup cost should live on the worker.
pub trait RemoteTask: Sized {
    type Args: DeserializeOwned;
    type Output: Serialize;

    fn new(args: Self::Args) -> Result<Self, TaskFailure>;
    fn run(self) -> Result<Self::Output, TaskFailure>;
}

type Handler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, TaskFailure> + Send + Sync>;
type CallableResolver = Box<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>, TaskFailure> + Send + Sync>;

/// Name → handler table; the default [`TaskRunner`].
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Handler>,
    callable: Option<CallableResolver>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler under `name`.
    pub fn register<A, R, F>(&mut self, name: &str, f: F)
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R, TaskFailure> + Send + Sync + 'static,
    {
        self.handlers.insert(
            name.to_owned(),
            Box::new(move |args| {
                let args: A = codec::from_payload(args)
                    .map_err(|e| TaskFailure::msg(format!("bad arguments: {e}")))?;
                let out = f(args)?;
                codec::to_payload(&out)
                    .map_err(|e| TaskFailure::msg(format!("bad return value: {e}")))
            }),
        );
    }

    /// Register `T` under `name` with constructor + run semantics.
    pub fn register_task<T: RemoteTask + 'static>(&mut self, name: &str) {
        self.register::<T::Args, T::Output, _>(name, |args| T::new(args)?.run());
    }

    /// Install a resolver for [`TaskTarget::Callable`] blobs.
    ///
    /// The resolver receives `(blob, args)` and returns the encoded value.
    pub fn set_callable_resolver<F>(&mut self, f: F)
    where
        F: Fn(&[u8], &[u8]) -> Result<Vec<u8>, TaskFailure> + Send + Sync + 'static,
    {
        self.callable = Some(Box::new(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }
}

impl TaskRunner for TaskRegistry {
    fn run(&self, target: &TaskTarget, args: &[u8]) -> Result<Vec<u8>, TaskFailure> {
        match target {
            TaskTarget::Named(name) => match self.handlers.get(name.as_str()) {
                Some(handler) => handler(args),
                None => Err(TaskFailure::msg(format!("unknown task '{name}'"))),
            },
            TaskTarget::Callable(blob) => match &self.callable {
                Some(resolver) => resolver(blob, args),
                None => Err(TaskFailure::msg(
                    "callable targets are not supported by this worker; \
                     register tasks by name or install a callable resolver",
                )),
            },
        }
    }
}
