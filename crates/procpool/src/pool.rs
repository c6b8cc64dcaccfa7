//! Bounded pool of idle workers.
//!
//! Workers live in a FIFO idle channel so load spreads across the pool
//! instead of pinning one worker hot. Spawning is lazy: a worker is created
//! only when a checkout arrives, no idle worker exists, and the cap permits.
//! Checkin recycles workers that have served `max_reqs` requests and retires
//! dead ones; a worker with replies still in flight re-enters the idle
//! channel only after its reader drains them.
//!
//! Checkout/checkin bookkeeping invariant: every successful `checkout` is
//! paired with exactly one `checkin` (or `kill`), and
//! `num_procs == idle + checked-out + draining` at every suspension point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};

use crate::codec::{Bincode, Codec};
use crate::entry::WorkerCommand;
use crate::error::{Error, Result};
use crate::sched;
use crate::worker::Worker;

/// Pool sizing and recycling policy.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on live workers. Must be at least 1.
    pub max_procs: usize,
    /// Retire a worker once it has accepted this many requests; 0 disables
    /// recycling.
    pub max_reqs: u64,
    /// How worker processes are started.
    pub worker: WorkerCommand,
}

impl PoolConfig {
    pub fn new(worker: WorkerCommand) -> Self {
        PoolConfig { max_procs: default_max_procs(), max_reqs: 0, worker }
    }
}

/// Default worker cap: one per available CPU.
pub fn default_max_procs() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

struct State {
    num_procs: usize,
    is_running: bool,
    /// True while `shutdown` is draining; checkouts fail fast during this
    /// window, and a completed shutdown restarts implicitly on first use.
    stopping: bool,
}

struct PoolInner {
    config: PoolConfig,
    codec: Arc<dyn Codec>,
    state: StdMutex<State>,
    idle_tx: mpsc::UnboundedSender<Arc<Worker>>,
    /// Shared receiver; the fair mutex queue gives waiting checkouts FIFO
    /// order.
    idle_rx: Mutex<mpsc::UnboundedReceiver<Arc<Worker>>>,
    idle_len: AtomicUsize,
    /// Signalled on every worker retirement or idle push; `shutdown` waits
    /// on it while draining.
    changed: Notify,
}

/// Bounded multiset of workers behind a FIFO idle channel.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with the default codec.
    pub fn new(config: PoolConfig) -> Result<Pool> {
        Pool::with_codec(config, Arc::new(Bincode))
    }

    pub fn with_codec(config: PoolConfig, codec: Arc<dyn Codec>) -> Result<Pool> {
        platform_check()?;
        if config.max_procs == 0 {
            return Err(Error::InvalidArg("max_procs must be at least 1"));
        }

        let (idle_tx, idle_rx) = mpsc::unbounded_channel();
        Ok(Pool {
            inner: Arc::new(PoolInner {
                config,
                codec,
                state: StdMutex::new(State {
                    num_procs: 0,
                    is_running: true,
                    stopping: false,
                }),
                idle_tx,
                idle_rx: Mutex::new(idle_rx),
                idle_len: AtomicUsize::new(0),
                changed: Notify::new(),
            }),
        })
    }

    /// Rent a worker.
    ///
    /// Spawns lazily while below `max_procs`, otherwise takes from the idle
    /// channel, suspending until one is available. With a timeout, the take
    /// is raced against a timer; the take side of the race is cancel-safe,
    /// so a worker arriving at the instant the timer fires stays in the
    /// channel rather than being lost.
    pub async fn checkout(&self, timeout: Option<Duration>) -> Result<Arc<Worker>> {
        {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            if !state.is_running {
                if state.stopping {
                    return Err(Error::PoolStopped);
                }
                // A completed shutdown restarts on first use.
                state.is_running = true;
            }

            if self.inner.idle_len.load(Ordering::SeqCst) == 0
                && state.num_procs < self.inner.config.max_procs
            {
                state.num_procs += 1;
                drop(state);
                return match Worker::spawn(&self.inner.config.worker, Arc::clone(&self.inner.codec))
                {
                    Ok(worker) => Ok(worker),
                    Err(e) => {
                        self.inner.state.lock().expect("pool state poisoned").num_procs -= 1;
                        self.inner.changed.notify_waiters();
                        Err(e)
                    }
                };
            }
        }

        let take = async {
            let mut rx = self.inner.idle_rx.lock().await;
            match rx.recv().await {
                Some(worker) => {
                    self.inner.idle_len.fetch_sub(1, Ordering::SeqCst);
                    Ok(worker)
                }
                // The sender lives as long as the pool; treat closure as a
                // stop rather than panicking.
                None => Err(Error::PoolStopped),
            }
        };

        match timeout {
            None => take.await,
            Some(duration) => {
                tokio::select! {
                    biased;
                    out = take => out,
                    _ = sched::sleep(duration) => Err(Error::CheckoutTimeout(duration)),
                }
            }
        }
    }

    /// Return a rented worker.
    ///
    /// Kills it instead when the pool is stopping, the worker has reached
    /// its request quota, or its pipes have already died. A worker with
    /// replies in flight is handed back to the idle channel by a drain task
    /// once its reader catches up.
    pub async fn checkin(&self, worker: Arc<Worker>) {
        let running = self.inner.state.lock().expect("pool state poisoned").is_running;
        let expired = self.inner.config.max_reqs > 0
            && worker.messages_sent() >= self.inner.config.max_reqs;

        if !running || expired || !worker.is_alive() {
            if expired {
                tracing::debug!(
                    pid = worker.pid(),
                    sent = worker.messages_sent(),
                    "recycling worker"
                );
            }
            self.kill(worker).await;
            return;
        }

        if worker.inflight() > 0 {
            let pool = self.clone();
            sched::spawn("pool-checkin", async move {
                worker.drained().await;
                pool.finish_checkin(worker).await;
            });
        } else {
            self.push_idle(worker);
        }
    }

    /// Complete a deferred checkin after the worker drained its replies.
    async fn finish_checkin(&self, worker: Arc<Worker>) {
        let running = self.inner.state.lock().expect("pool state poisoned").is_running;
        if !running || !worker.is_alive() {
            self.kill(worker).await;
        } else {
            self.push_idle(worker);
        }
    }

    fn push_idle(&self, worker: Arc<Worker>) {
        self.inner.idle_len.fetch_add(1, Ordering::SeqCst);
        if self.inner.idle_tx.send(worker).is_err() {
            self.inner.idle_len.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.changed.notify_waiters();
    }

    /// Shut a worker down and release its slot in the cap. Idempotent.
    pub async fn kill(&self, worker: Arc<Worker>) {
        if !worker.retire() {
            return;
        }
        worker.shutdown().await;
        self.inner.state.lock().expect("pool state poisoned").num_procs -= 1;
        self.inner.changed.notify_waiters();
        tracing::debug!(pid = worker.pid(), "worker retired");
    }

    /// Stop the pool and reap every worker.
    ///
    /// Workers currently rented out are killed by their `checkin` when they
    /// come home; this call suspends until the live count reaches zero.
    /// Afterwards the pool behaves as freshly constructed.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().expect("pool state poisoned");
            if !state.is_running && !state.stopping {
                return;
            }
            state.is_running = false;
            state.stopping = true;
        }

        loop {
            // Register for wakeups before inspecting the counter, otherwise
            // a retirement landing in between is a lost wakeup.
            let notified = self.inner.changed.notified();
            if self.num_procs() == 0 {
                break;
            }

            let taken = self.inner.idle_rx.lock().await.try_recv().ok();
            if let Some(worker) = taken {
                self.inner.idle_len.fetch_sub(1, Ordering::SeqCst);
                self.kill(worker).await;
                continue;
            }

            // Nothing idle: a rented or draining worker is still out there.
            notified.await;
        }

        self.inner.state.lock().expect("pool state poisoned").stopping = false;
        tracing::debug!("pool shut down");
    }

    /// Current idle-channel size.
    pub fn capacity(&self) -> usize {
        self.inner.idle_len.load(Ordering::SeqCst)
    }

    /// Live workers: idle + rented + draining.
    pub fn num_procs(&self) -> usize {
        self.inner.state.lock().expect("pool state poisoned").num_procs
    }

    pub fn max_procs(&self) -> usize {
        self.inner.config.max_procs
    }
}

fn platform_check() -> Result<()> {
    cfg_if::cfg_if! {
        if #[cfg(any(unix, windows))] {
            Ok(())
        } else {
            Err(Error::Unsupported("worker pipes require a unix or windows host"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_max_procs_positive() {
        assert!(default_max_procs() >= 1);
    }

    #[test]
    fn test_zero_procs_rejected() {
        let mut config = PoolConfig::new(WorkerCommand::new("unused"));
        config.max_procs = 0;
        assert!(matches!(Pool::new(config), Err(Error::InvalidArg(_))));
    }

    #[test]
    fn test_fresh_pool_counters() {
        let pool = Pool::new(PoolConfig::new(WorkerCommand::new("unused"))).unwrap();
        assert_eq!(pool.num_procs(), 0);
        assert_eq!(pool.capacity(), 0);
    }
}
