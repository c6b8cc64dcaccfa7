//! Worker process entry.
//!
//! A worker is the same kind of executable as the parent, switched into
//! serve mode. Two ways to get there:
//!
//! - [`run_if_worker`] — call first thing in `main()`. When the process was
//!   spawned with the worker marker in its environment it serves requests
//!   and exits; otherwise the call is a no-op and the program continues as
//!   the parent. This keeps parent and worker binaries identical, so task
//!   registrations resolve the same on both sides.
//! - A dedicated worker binary whose `main` calls [`run_worker`]
//!   unconditionally (see `procpool-worker`).
//!
//! The serve loop reads request frames from stdin until EOF, evaluates each
//! through the injected [`TaskRunner`] (catching panics), and writes exactly
//! one response frame per request to stdout. EOF on stdin is the shutdown
//! signal.

use std::ffi::OsString;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::codec::Codec;
use crate::frame::{read_frame, write_frame};
use crate::proto::{Outcome, Response};
use crate::runner::TaskRunner;

/// Environment variable that switches a process into worker mode.
pub const WORKER_ENV: &str = "PROCPOOL_WORKER";

/// How to start a worker child process.
///
/// Workers inherit the parent's environment (so search paths and task
/// registrations resolve identically); `env` entries are overlaid on top.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    /// Run `program` as the worker, with no marker set.
    ///
    /// Use for dedicated worker binaries that call [`run_worker`] directly.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        WorkerCommand { program: program.into(), args: Vec::new(), env: Vec::new() }
    }

    /// Re-execute the current binary with the worker marker set.
    ///
    /// Requires the binary to call [`run_if_worker`] early in `main()`.
    pub fn current_exe() -> io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).env(WORKER_ENV, "1"))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            // A dropped pool must not leak children.
            .kill_on_drop(true);
        cmd
    }
}

/// Serve requests if this process carries the worker marker; otherwise
/// return immediately.
///
/// Never returns when the marker is present: the process exits with the
/// serve loop's status. Call before starting any async runtime; the serve
/// loop brings its own.
pub fn run_if_worker(runner: &dyn TaskRunner, codec: &dyn Codec) {
    if std::env::var_os(WORKER_ENV).is_some() {
        std::process::exit(run_worker(runner, codec));
    }
}

/// Serve requests on stdin/stdout until EOF. Returns the process exit code.
pub fn run_worker(runner: &dyn TaskRunner, codec: &dyn Codec) -> i32 {
    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("procpool worker: failed to start runtime: {e}");
            return 2;
        }
    };

    let result = rt.block_on(serve(runner, codec, tokio::io::stdin(), tokio::io::stdout()));
    match result {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("procpool worker: {e}");
            1
        }
    }
}

/// The request/response loop, split out over generic streams for testing.
pub(crate) async fn serve<R, W>(
    runner: &dyn TaskRunner,
    codec: &dyn Codec,
    mut reader: R,
    mut writer: W,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(payload) = read_frame(&mut reader).await? {
        let req = codec
            .decode_request(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        let outcome = evaluate(runner, &req.target, &req.args);
        let response = Response { id: req.id, outcome };
        let bytes = codec
            .encode_response(&response)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        write_frame(&mut writer, &bytes).await?;
    }
    Ok(())
}

/// Run one task, converting failures and panics into wire outcomes.
fn evaluate(runner: &dyn TaskRunner, target: &crate::proto::TaskTarget, args: &[u8]) -> Outcome {
    match panic::catch_unwind(AssertUnwindSafe(|| runner.run(target, args))) {
        Ok(Ok(bytes)) => Outcome::Ok(bytes),
        Ok(Err(failure)) => Outcome::Err { message: failure.message, trace: failure.trace },
        Err(panic) => Outcome::Err {
            message: format!("task panicked: {}", panic_message(&panic)),
            trace: None,
        },
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Bincode};
    use crate::proto::{Request, TaskTarget};
    use crate::runner::{TaskFailure, TaskRegistry};

    fn registry() -> TaskRegistry {
        let mut reg = TaskRegistry::new();
        reg.register("double", |n: i64| Ok(n * 2));
        reg.register("panic", |_: ()| -> Result<(), TaskFailure> { panic!("kaboom") });
        reg
    }

    async fn send_request(
        pipe: &mut tokio::io::DuplexStream,
        id: u64,
        target: TaskTarget,
        args: Vec<u8>,
    ) {
        let req = Request { id, target, args };
        let bytes = Bincode.encode_request(&req).unwrap();
        write_frame(pipe, &bytes).await.unwrap();
    }

    async fn read_response(pipe: &mut tokio::io::DuplexStream) -> Response {
        let bytes = read_frame(pipe).await.unwrap().unwrap();
        Bincode.decode_response(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_serve_round_trip() {
        let (mut req_tx, req_rx) = tokio::io::duplex(4096);
        let (res_tx, mut res_rx) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let reg = registry();
            serve(&reg, &Bincode, req_rx, res_tx).await
        });

        send_request(&mut req_tx, 5, "double".into(), codec::to_payload(&21i64).unwrap()).await;

        let response = read_response(&mut res_rx).await;
        assert_eq!(response.id, 5);
        match response.outcome {
            Outcome::Ok(bytes) => assert_eq!(codec::from_payload::<i64>(&bytes).unwrap(), 42),
            Outcome::Err { message, .. } => panic!("unexpected failure: {message}"),
        }

        drop(req_tx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_reports_panics() {
        let (mut req_tx, req_rx) = tokio::io::duplex(4096);
        let (res_tx, mut res_rx) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let reg = registry();
            serve(&reg, &Bincode, req_rx, res_tx).await
        });

        send_request(&mut req_tx, 1, "panic".into(), codec::to_payload(&()).unwrap()).await;

        let response = read_response(&mut res_rx).await;
        match response.outcome {
            Outcome::Err { message, .. } => assert!(message.contains("kaboom")),
            Outcome::Ok(_) => panic!("expected panic outcome"),
        }

        drop(req_tx);
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_serve_rejects_garbage() {
        let (mut req_tx, req_rx) = tokio::io::duplex(4096);
        let (res_tx, _res_rx) = tokio::io::duplex(4096);

        let server = tokio::spawn(async move {
            let reg = registry();
            serve(&reg, &Bincode, req_rx, res_tx).await
        });

        write_frame(&mut req_tx, &[0xde, 0xad]).await.unwrap();
        assert!(server.await.unwrap().is_err());
    }
}
