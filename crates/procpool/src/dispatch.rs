//! Public submission surfaces.
//!
//! All four surfaces funnel through the same two steps: `start_task` rents a
//! worker, sends, and records `msgid → worker` in the pending table;
//! `collect_task` checks the worker back in and waits for the reply. The
//! checkin happens before the wait: replies are multiplexed by message id,
//! so the pool may hand the worker to the next submitter as soon as the
//! send has been accepted.

use std::collections::HashMap;
use std::ffi::OsString;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::codec::{self, Codec};
use crate::entry::WorkerCommand;
use crate::error::{Error, Result};
use crate::pool::{default_max_procs, Pool, PoolConfig};
use crate::proto::{MsgId, TaskTarget};
use crate::sched;
use crate::worker::Worker;

/// Success callback for [`TaskPool::queue`].
pub type SuccessFn<R> = Box<dyn FnOnce(R) + Send>;
/// Error callback for [`TaskPool::queue`].
pub type ErrorFn = Box<dyn FnOnce(Error) + Send>;

struct DispatchInner {
    pool: Pool,
    /// msgid → the worker that will answer it.
    pending: StdMutex<HashMap<MsgId, Arc<Worker>>>,
}

/// Handle to the task pool. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct TaskPool {
    inner: Arc<DispatchInner>,
}

impl TaskPool {
    /// Pool with defaults: one worker per CPU, no recycling, workers spawned
    /// by re-executing the current binary (which must call
    /// [`run_if_worker`](crate::entry::run_if_worker) early in `main`).
    pub fn new() -> Result<TaskPool> {
        TaskPool::builder().build()
    }

    pub fn builder() -> TaskPoolBuilder {
        TaskPoolBuilder {
            max_procs: default_max_procs(),
            max_reqs: 0,
            worker: None,
            env: Vec::new(),
            codec: None,
        }
    }

    /// Run one task to completion. Suspends the caller; the acquire timeout
    /// (if any) applies only to renting a worker, never to the task itself.
    pub async fn process<A, R>(
        &self,
        target: impl Into<TaskTarget>,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let id = self.start_task(target.into(), codec::to_payload(args)?, timeout).await?;
        let bytes = self.collect_task(id).await?;
        Ok(codec::from_payload(&bytes)?)
    }

    /// Run the task once per input and return the results in input order.
    ///
    /// Every input is submitted before any result is awaited, so the batch
    /// fans out across up to `max_procs` workers while the output order
    /// stays deterministic regardless of completion order.
    pub async fn map<T, R>(
        &self,
        target: impl Into<TaskTarget>,
        inputs: impl IntoIterator<Item = T>,
    ) -> Result<Vec<R>>
    where
        T: Serialize,
        R: DeserializeOwned + Send + 'static,
    {
        let target = target.into();
        let inputs: Vec<T> = inputs.into_iter().collect();

        let submits = inputs.iter().map(|input| self.defer(target.clone(), input));
        let deferred: Vec<Deferred<R>> = future::try_join_all(submits).await?;

        let mut results = Vec::with_capacity(deferred.len());
        for handle in deferred {
            results.push(handle.await?);
        }
        Ok(results)
    }

    /// Submit a task and return a [`Deferred`] resolving to its result.
    ///
    /// The send happens before this returns, so submission order is the
    /// caller's call order; only the wait is deferred.
    pub async fn defer<A, R>(
        &self,
        target: impl Into<TaskTarget>,
        args: &A,
    ) -> Result<Deferred<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let id = self.start_task(target.into(), codec::to_payload(args)?, None).await?;

        let (tx, rx) = oneshot::channel();
        let this = self.clone();
        sched::spawn("task-collect", async move {
            let out = this.collect_typed::<R>(id).await;
            let _ = tx.send(out);
        });

        Ok(Deferred { rx })
    }

    /// Fire-and-forget submission with optional outcome callbacks.
    ///
    /// Whichever callback matches the outcome is invoked from a background
    /// task; an absent callback drops that outcome (logged at debug level).
    pub async fn queue<A, R>(
        &self,
        target: impl Into<TaskTarget>,
        args: &A,
        on_success: Option<SuccessFn<R>>,
        on_error: Option<ErrorFn>,
    ) -> Result<()>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let id = self.start_task(target.into(), codec::to_payload(args)?, None).await?;

        let this = self.clone();
        sched::spawn("queue-collect", async move {
            match this.collect_typed::<R>(id).await {
                Ok(value) => match on_success {
                    Some(callback) => callback(value),
                    None => tracing::debug!(id, "queued task result dropped (no callback)"),
                },
                Err(e) => match on_error {
                    Some(callback) => callback(e),
                    None => tracing::debug!(id, "queued task error dropped (no callback): {e}"),
                },
            }
        });

        Ok(())
    }

    /// Rent a worker, send, and record the pending entry.
    ///
    /// On a send failure the worker is checked back in before the error
    /// surfaces, so no submission path can leak a worker.
    pub async fn start_task(
        &self,
        target: TaskTarget,
        args: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<MsgId> {
        validate_target(&target)?;

        let worker = self.inner.pool.checkout(timeout).await?;
        match worker.send(target, args).await {
            Ok(id) => {
                self.inner
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .insert(id, worker);
                Ok(id)
            }
            Err(e) => {
                self.inner.pool.checkin(worker).await;
                Err(e)
            }
        }
    }

    /// Check the worker back in, then wait for the reply to `id`.
    pub async fn collect_task(&self, id: MsgId) -> Result<Vec<u8>> {
        let worker = self
            .inner
            .pending
            .lock()
            .expect("pending table poisoned")
            .remove(&id)
            .ok_or(Error::UnknownMsgId(id))?;

        self.inner.pool.checkin(Arc::clone(&worker)).await;
        worker.recv(id).await
    }

    async fn collect_typed<R: DeserializeOwned>(&self, id: MsgId) -> Result<R> {
        let bytes = self.collect_task(id).await?;
        Ok(codec::from_payload(&bytes)?)
    }

    /// Stop all workers and clear the pending table. The pool is reusable:
    /// the next submission behaves as on a freshly constructed pool.
    pub async fn shutdown(&self) {
        self.inner.pool.shutdown().await;
        self.inner.pending.lock().expect("pending table poisoned").clear();
    }

    /// Current idle-channel size.
    pub fn capacity(&self) -> usize {
        self.inner.pool.capacity()
    }

    /// Live worker count.
    pub fn num_procs(&self) -> usize {
        self.inner.pool.num_procs()
    }

    /// The underlying worker pool.
    pub fn pool(&self) -> &Pool {
        &self.inner.pool
    }
}

fn validate_target(target: &TaskTarget) -> Result<()> {
    if let TaskTarget::Named(name) = target {
        if name.is_empty() {
            return Err(Error::InvalidArg("task name must not be empty"));
        }
    }
    Ok(())
}

/// Configures and builds a [`TaskPool`].
pub struct TaskPoolBuilder {
    max_procs: usize,
    max_reqs: u64,
    worker: Option<WorkerCommand>,
    env: Vec<(OsString, OsString)>,
    codec: Option<Arc<dyn Codec>>,
}

impl TaskPoolBuilder {
    /// Upper bound on live workers. Defaults to the CPU count.
    pub fn max_procs(mut self, n: usize) -> Self {
        self.max_procs = n;
        self
    }

    /// Recycle workers after this many requests. Defaults to 0 (never).
    pub fn max_reqs(mut self, n: u64) -> Self {
        self.max_reqs = n;
        self
    }

    /// Use an explicit worker command instead of re-executing the current
    /// binary.
    pub fn worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker = Some(command);
        self
    }

    /// Set an extra environment variable in every worker process.
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Override the wire codec. Both ends of the pipe must agree.
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn build(self) -> Result<TaskPool> {
        let mut worker = match self.worker {
            Some(command) => command,
            None => WorkerCommand::current_exe().map_err(Error::Spawn)?,
        };
        for (key, value) in self.env {
            worker = worker.env(key, value);
        }

        let mut config = PoolConfig::new(worker);
        config.max_procs = self.max_procs;
        config.max_reqs = self.max_reqs;

        let pool = match self.codec {
            Some(codec) => Pool::with_codec(config, codec)?,
            None => Pool::new(config)?,
        };

        Ok(TaskPool {
            inner: Arc::new(DispatchInner { pool, pending: StdMutex::new(HashMap::new()) }),
        })
    }
}

/// Single-shot handle to a deferred task.
///
/// Awaiting it yields the task's value or re-raises the captured error.
/// Holds only the result channel, never a reference back to the worker.
pub struct Deferred<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Future for Deferred<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|res| match res {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::WorkerDead("deferred collector dropped".to_owned())),
        })
    }
}
