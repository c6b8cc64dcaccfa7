//! Process-level task pool.
//!
//! Offload `(target, args)` tasks to a bounded set of long-lived worker
//! child processes. Workers are spawned lazily, checked out over a FIFO
//! idle channel, optionally recycled after a request quota, and talk to the
//! parent over a framed binary protocol on their stdin/stdout pipes.
//!
//! Four submission surfaces share one dispatch path:
//!
//! - [`TaskPool::process`] — synchronous for the caller (suspends).
//! - [`TaskPool::map`] — batch over inputs, results in input order.
//! - [`TaskPool::defer`] — returns a [`Deferred`] future.
//! - [`TaskPool::queue`] — fire-and-forget with outcome callbacks.
//!
//! Workers run the same kind of binary as the parent. Tasks are addressed
//! by registered name: closures cannot cross a process boundary, so any
//! captured state must travel in the (serialized) arguments, or live in a
//! [`RemoteTask`] constructed on the worker side.
//!
//! ```no_run
//! use procpool::{run_if_worker, tasks, Bincode, TaskPool};
//!
//! fn main() -> procpool::Result<()> {
//!     // Must run first, before any runtime exists: when this process is
//!     // spawned as a worker it serves tasks here and never returns.
//!     let registry = tasks::registry();
//!     run_if_worker(&registry, &Bincode);
//!
//!     let rt = tokio::runtime::Builder::new_current_thread()
//!         .enable_all()
//!         .build()
//!         .expect("runtime");
//!     rt.block_on(async {
//!         let pool = TaskPool::builder().max_procs(2).build()?;
//!
//!         let doubled: i64 = pool.process("double", &21i64, None).await?;
//!         assert_eq!(doubled, 42);
//!
//!         let batch: Vec<i64> = pool.map("double", 1i64..=10).await?;
//!         assert_eq!(batch[9], 20);
//!
//!         pool.shutdown().await;
//!         Ok(())
//!     })
//! }
//! ```

pub mod codec;
pub mod dispatch;
pub mod entry;
pub mod error;
pub mod frame;
pub mod pool;
pub mod proto;
pub mod runner;
mod sched;
pub mod tasks;
pub mod worker;

pub use codec::{Bincode, Codec, CodecError};
pub use dispatch::{Deferred, ErrorFn, SuccessFn, TaskPool, TaskPoolBuilder};
pub use entry::{run_if_worker, run_worker, WorkerCommand, WORKER_ENV};
pub use error::{Error, Result, TaskError};
pub use pool::{Pool, PoolConfig};
pub use proto::{MsgId, TaskTarget};
pub use runner::{RemoteTask, TaskFailure, TaskRegistry, TaskRunner};
pub use worker::Worker;
