//! Thin adapter over the host scheduler.
//!
//! Every background task the library starts goes through [`spawn`] so it
//! carries a name in trace output, and every timer goes through [`sleep`].
//! This is the only module that touches the runtime's scheduling surface;
//! porting to another executor means porting this file.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Spawn a named background task.
///
/// The returned handle can be awaited for the task's output or aborted to
/// cancel it at its next suspension point.
pub(crate) fn spawn<F>(name: &'static str, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(async move {
        tracing::trace!(task = name, "task started");
        let out = fut.await;
        tracing::trace!(task = name, "task finished");
        out
    })
}

/// Suspend the calling task for `duration`.
pub(crate) async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}
