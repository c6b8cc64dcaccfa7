//! One worker child process and its full-duplex, multiplexed RPC.
//!
//! A `Worker` owns the child handle and the pipe pair. Requests are written
//! to the child's stdin one frame at a time; a long-lived reader task pulls
//! response frames off the child's stdout and routes each to its result slot
//! by message id. Several submitters may wait on the same worker
//! concurrently; the reader is the only consumer of the inbound pipe.
//!
//! Slot protocol: if the submitter reaches [`Worker::recv`] first it parks a
//! sender in the slot; if the reply arrives first the reader parks the value.
//! Whoever comes second completes the hand-off. On EOF or a protocol error
//! the reader marks the worker dead and fails every parked submitter.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::codec::Codec;
use crate::entry::WorkerCommand;
use crate::error::{Error, Result, TaskError};
use crate::frame::{read_frame, write_frame};
use crate::proto::{self, MsgId, Outcome, Request, Response, TaskTarget};
use crate::sched;

/// A decoded reply payload, or the error that stands in for one.
type SlotValue = Result<Vec<u8>>;

enum Slot {
    /// A submitter is parked, waiting for the reply.
    Waiting(oneshot::Sender<SlotValue>),
    /// The reply arrived before the submitter did.
    Arrived(SlotValue),
}

struct SlotTable {
    slots: HashMap<MsgId, Slot>,
    /// Requests written and not yet answered or failed.
    outstanding: usize,
    /// Set once the reader stops; the reason every later `recv` fails with.
    dead: Option<String>,
}

struct Shared {
    table: StdMutex<SlotTable>,
    /// Signalled whenever `outstanding` drops to zero.
    drained: Notify,
    messages_sent: AtomicU64,
}

impl Shared {
    /// Mark the worker dead and fail every parked submitter. Idempotent;
    /// replies that already arrived stay claimable.
    fn fail(&self, reason: String) {
        let mut table = self.table.lock().expect("slot table poisoned");
        if table.dead.is_some() {
            return;
        }
        table.dead = Some(reason.clone());
        table.outstanding = 0;

        let slots = std::mem::take(&mut table.slots);
        for (id, slot) in slots {
            match slot {
                Slot::Waiting(tx) => {
                    let _ = tx.send(Err(Error::WorkerDead(reason.clone())));
                }
                arrived @ Slot::Arrived(_) => {
                    table.slots.insert(id, arrived);
                }
            }
        }
        drop(table);
        self.drained.notify_waiters();
    }
}

/// A long-lived worker child process.
pub struct Worker {
    pid: u32,
    /// Outbound sink. Locked per frame; `None` once closed.
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
    codec: Arc<dyn Codec>,
    /// Guards pool bookkeeping so a worker is only ever retired once.
    retired: AtomicBool,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("retired", &self.retired.load(std::sync::atomic::Ordering::Relaxed))
            .finish()
    }
}

impl Worker {
    /// Start a worker process and its reader task.
    ///
    /// Must be called from within the runtime (the reader is spawned here).
    pub fn spawn(command: &WorkerCommand, codec: Arc<dyn Codec>) -> Result<Arc<Worker>> {
        let mut child = command.to_command().spawn().map_err(Error::Spawn)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn(io::Error::other("worker stdin was not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn(io::Error::other("worker stdout was not piped")))?;
        let pid = child.id().unwrap_or(0);

        let shared = Arc::new(Shared {
            table: StdMutex::new(SlotTable {
                slots: HashMap::new(),
                outstanding: 0,
                dead: None,
            }),
            drained: Notify::new(),
            messages_sent: AtomicU64::new(0),
        });

        let reader = sched::spawn(
            "worker-reader",
            reader_loop(Arc::clone(&shared), stdout, Arc::clone(&codec), pid),
        );

        tracing::debug!(pid, "worker spawned");

        Ok(Arc::new(Worker {
            pid,
            stdin: Mutex::new(Some(stdin)),
            child: Mutex::new(Some(child)),
            reader: StdMutex::new(Some(reader)),
            shared,
            codec,
            retired: AtomicBool::new(false),
        }))
    }

    /// Queue one task outbound and return its message id.
    ///
    /// Writes are serialized; id order equals frame order. Fails with
    /// [`Error::WorkerDead`] once the sink is closed or the reader stopped.
    pub async fn send(&self, target: TaskTarget, args: Vec<u8>) -> Result<MsgId> {
        let mut stdin = self.stdin.lock().await;
        let sink = stdin
            .as_mut()
            .ok_or_else(|| Error::WorkerDead("outbound pipe closed".to_owned()))?;

        // A dead reader means the reply could never arrive.
        let dead = self.shared.table.lock().expect("slot table poisoned").dead.clone();
        if let Some(reason) = dead {
            return Err(Error::WorkerDead(reason));
        }

        let id = proto::next_msg_id();
        let bytes = self.codec.encode_request(&Request { id, target, args })?;

        // Count before writing; the reply can race the tail of the write.
        self.shared.table.lock().expect("slot table poisoned").outstanding += 1;

        if let Err(e) = write_frame(sink, &bytes).await {
            self.shared.fail(format!("write failed: {e}"));
            return Err(Error::WorkerDead(e.to_string()));
        }

        self.shared.messages_sent.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pid = self.pid, id, "request sent");
        Ok(id)
    }

    /// Suspend until the reply for `id` arrives, then return its payload.
    ///
    /// Re-raises remote failures as [`Error::Task`]; fails with
    /// [`Error::WorkerDead`] if the worker exits first.
    pub async fn recv(&self, id: MsgId) -> Result<Vec<u8>> {
        let rx = {
            let mut table = self.shared.table.lock().expect("slot table poisoned");
            match table.slots.remove(&id) {
                Some(Slot::Arrived(value)) => return value,
                Some(Slot::Waiting(tx)) => {
                    // Someone is already parked on this id.
                    table.slots.insert(id, Slot::Waiting(tx));
                    return Err(Error::UnknownMsgId(id));
                }
                None => {
                    if let Some(reason) = &table.dead {
                        return Err(Error::WorkerDead(reason.clone()));
                    }
                    let (tx, rx) = oneshot::channel();
                    table.slots.insert(id, Slot::Waiting(tx));
                    rx
                }
            }
        };

        match rx.await {
            Ok(value) => value,
            Err(_) => Err(Error::WorkerDead("worker shut down before replying".to_owned())),
        }
    }

    /// Close the outbound sink, wait for the child to drain and exit, then
    /// join the reader. Pending submitters fail with [`Error::WorkerDead`].
    /// Idempotent.
    pub async fn shutdown(&self) {
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            match child.wait().await {
                Ok(status) => tracing::debug!(pid = self.pid, %status, "worker exited"),
                Err(e) => tracing::debug!(pid = self.pid, "worker reap failed: {e}"),
            }
        }

        let reader = self.reader.lock().expect("reader handle poisoned").take();
        if let Some(handle) = reader {
            let _ = handle.await;
        }

        self.shared.fail("worker shut down".to_owned());
    }

    /// Total accepted sends over the worker's lifetime.
    pub fn messages_sent(&self) -> u64 {
        self.shared.messages_sent.load(Ordering::Relaxed)
    }

    /// Requests written but not yet answered.
    pub fn inflight(&self) -> usize {
        self.shared.table.lock().expect("slot table poisoned").outstanding
    }

    /// Suspend until no request is awaiting a reply.
    pub async fn drained(&self) {
        loop {
            let notified = self.shared.drained.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// False once the pipes have closed or the reader has stopped.
    pub fn is_alive(&self) -> bool {
        self.shared.table.lock().expect("slot table poisoned").dead.is_none()
    }

    /// OS process id of the child (0 if it already exited at spawn time).
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// First caller wins; used by the pool to decrement its count once.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::SeqCst)
    }
}

/// Per-worker reader: pump response frames until EOF or protocol error.
async fn reader_loop(
    shared: Arc<Shared>,
    mut source: ChildStdout,
    codec: Arc<dyn Codec>,
    pid: u32,
) {
    loop {
        match read_frame(&mut source).await {
            Ok(Some(payload)) => match codec.decode_response(&payload) {
                Ok(response) => deliver(&shared, response, pid),
                Err(e) => {
                    tracing::warn!(pid, "undecodable reply: {e}");
                    shared.fail(format!("protocol error: {e}"));
                    return;
                }
            },
            Ok(None) => {
                tracing::debug!(pid, "worker closed its pipe");
                shared.fail("worker closed its pipe".to_owned());
                return;
            }
            Err(e) => {
                shared.fail(format!("read failed: {e}"));
                return;
            }
        }
    }
}

/// Route one response into its slot.
fn deliver(shared: &Shared, response: Response, pid: u32) {
    let value = match response.outcome {
        Outcome::Ok(bytes) => Ok(bytes),
        Outcome::Err { message, trace } => Err(Error::Task(TaskError { message, trace })),
    };

    let mut table = shared.table.lock().expect("slot table poisoned");
    table.outstanding = table.outstanding.saturating_sub(1);
    match table.slots.remove(&response.id) {
        Some(Slot::Waiting(tx)) => {
            let _ = tx.send(value);
        }
        Some(arrived @ Slot::Arrived(_)) => {
            // Exactly one response per request; keep the first.
            table.slots.insert(response.id, arrived);
            tracing::warn!(pid, id = response.id, "duplicate reply dropped");
        }
        None => {
            table.slots.insert(response.id, Slot::Arrived(value));
        }
    }
    let idle = table.outstanding == 0;
    drop(table);
    if idle {
        shared.drained.notify_waiters();
    }
}
