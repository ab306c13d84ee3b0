//! Backend CLI invocation.
//!
//! Every driver shells out through the `Exec` seam, so tests swap in a mock
//! executor and the remote proxy swaps in an SSH transport without the
//! drivers noticing. `DefaultExec` is the real thing: it spawns the tool,
//! feeds stdin, captures both streams (malformed UTF-8 replaced), optionally
//! streams stdout line by line, and escalates SIGTERM to SIGKILL when a
//! timeout expires.

use crate::error::{Error, Result};
use async_trait::async_trait;
use dyn_clone::{clone_trait_object, DynClone};
use log::{debug, trace, warn};
use serde::Serialize;
use std::{fmt::Debug, path::Path, time::Duration};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, watch},
};

/// How long a child gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Create a linked cancellation pair. The handle side stays with the
/// caller; the token side travels with the operation.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelToken { rx })
}

#[derive(Debug)]
/// Caller-side trigger for cancelling an in-flight operation.
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Clone, Debug)]
/// Operation-side view of a cancellation request.
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. A handle that is dropped
    /// without firing means the operation runs to completion, so this
    /// pends forever in that case.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
/// What a command invocation is, from the transport's point of view. The
/// SSH proxy retries exec-like invocations with sudo but not raw transfers.
pub enum InvocationKind {
    Exec,
    Transfer,
}

#[derive(Clone, Debug, Default)]
/// Per-invocation options.
pub struct ExecOpts {
    /// Bytes piped to the child's stdin; stdin is closed afterwards.
    pub stdin: Option<Vec<u8>>,

    /// Wall-clock limit; `None` waits forever.
    pub timeout: Option<Duration>,

    /// Stdout lines are sent here as they arrive. A full channel
    /// back-pressures the reader (and ultimately the child).
    pub line_sink: Option<mpsc::Sender<String>>,

    /// Cancellation token from the caller; firing it terminates the child
    /// the same way a timeout does, but reports `cancelled`.
    pub cancel: Option<CancelToken>,

    /// Invocation classification for the transport.
    pub kind: Option<InvocationKind>,
}

impl ExecOpts {
    pub fn invocation_kind(&self) -> InvocationKind {
        self.kind.unwrap_or(InvocationKind::Exec)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
/// Captured outcome of one invocation.
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
/// The command execution seam every driver goes through.
pub trait Exec: Debug + DynClone + Send + Sync {
    /// Run `binary` with `args` and return the captured outcome. A non-zero
    /// exit is an `Ok` outcome; only failing to run the tool is an error.
    async fn run(&self, binary: &Path, args: &[String], opts: ExecOpts) -> Result<ExecOutput>;
}

clone_trait_object!(Exec);

#[derive(Clone, Debug, Default)]
/// Executes commands on the local host.
pub struct DefaultExec;

/// Read a stream to EOF, appending to `collected` as lines arrive so a
/// caller can snapshot partial output even while the reader is blocked on a
/// pipe some orphaned grandchild still holds open.
async fn drain(
    reader: impl tokio::io::AsyncRead + Unpin,
    sink: Option<mpsc::Sender<String>>,
    collected: std::sync::Arc<std::sync::Mutex<String>>,
) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf).into_owned();
                collected.lock().expect("output buffer lock").push_str(&line);
                if let Some(tx) = &sink {
                    // ignore a closed receiver; capture continues regardless
                    let _ = tx.send(line.trim_end_matches('\n').to_string()).await;
                }
            }
        }
    }
}

/// How a wait on the child ended.
enum Wait {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// SIGTERM, a grace period, then SIGKILL.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        warn!("Child {} ignored SIGTERM, sending SIGKILL", pid);
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[async_trait]
impl Exec for DefaultExec {
    async fn run(&self, binary: &Path, args: &[String], opts: ExecOpts) -> Result<ExecOutput> {
        trace!("Running {} {}", binary.display(), args.join(" "));

        let mut command = Command::new(binary);
        command
            .args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if opts.stdin.is_some() {
            command.stdin(std::process::Stdio::piped());
        } else {
            command.stdin(std::process::Stdio::null());
        }

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::backend_unavailable(format!("{} not found", binary.display()))
            } else {
                Error::from(e)
            }
        })?;

        let stdout_pipe = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("child stdout not captured"))?;
        let stderr_pipe = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("child stderr not captured"))?;

        let stdout_buf = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let stderr_buf = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let stdout_task = tokio::spawn(drain(
            stdout_pipe,
            opts.line_sink.clone(),
            std::sync::Arc::clone(&stdout_buf),
        ));
        let stderr_task = tokio::spawn(drain(
            stderr_pipe,
            None,
            std::sync::Arc::clone(&stderr_buf),
        ));

        if let Some(bytes) = &opts.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // a child may legitimately exit without reading stdin
                let _ = stdin.write_all(bytes).await;
                let _ = stdin.shutdown().await;
            }
        }

        let wait = {
            let cancel = opts.cancel.clone();
            let cancel_fut = async move {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            let timeout_fut = async {
                match opts.timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                status = child.wait() => Wait::Exited(status?),
                _ = timeout_fut => Wait::TimedOut,
                _ = cancel_fut => Wait::Cancelled,
            }
        };

        let status = match wait {
            Wait::Exited(status) => status,
            interrupted => {
                terminate(&mut child).await;
                // the readers may never see EOF if the child leaked its
                // pipes to an orphan; snapshot whatever arrived so far
                let _ = tokio::time::timeout(Duration::from_millis(200), async {
                    let _ = stdout_task.await;
                    let _ = stderr_task.await;
                })
                .await;
                let stdout = stdout_buf.lock().expect("output buffer lock").clone();
                let stderr = stderr_buf.lock().expect("output buffer lock").clone();
                let err = match interrupted {
                    Wait::TimedOut => Error::timeout(format!(
                        "command timed out after {}ms",
                        opts.timeout.map(|t| t.as_millis()).unwrap_or_default()
                    )),
                    _ => Error::cancelled("command cancelled by caller"),
                };
                return Err(err.with_output(stdout, stderr));
            }
        };

        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let stdout = stdout_buf.lock().expect("output buffer lock").clone();
        let stderr = stderr_buf.lock().expect("output buffer lock").clone();
        let exit_code = status.code().unwrap_or(-1);
        debug!(
            "{} exited with {} ({} stdout bytes)",
            binary.display(),
            exit_code,
            stdout.len()
        );

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        path::PathBuf,
        sync::{Arc, Mutex},
    };

    #[derive(Debug, Default)]
    struct MockState {
        responses: Mutex<VecDeque<Result<ExecOutput>>>,
        calls: Mutex<Vec<(PathBuf, Vec<String>, Option<Vec<u8>>)>>,
    }

    #[derive(Clone, Debug, Default)]
    /// Scripted executor: returns queued responses in order, then empty
    /// successes. Records every invocation for assertions.
    pub struct MockExec {
        state: Arc<MockState>,
    }

    impl MockExec {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_ok(&self, stdout: &str) -> &Self {
            self.state
                .responses
                .lock()
                .unwrap()
                .push_back(Ok(ExecOutput {
                    exit_code: 0,
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                }));
            self
        }

        pub fn push_exit(&self, exit_code: i32, stderr: &str) -> &Self {
            self.state
                .responses
                .lock()
                .unwrap()
                .push_back(Ok(ExecOutput {
                    exit_code,
                    stdout: String::new(),
                    stderr: stderr.to_string(),
                }));
            self
        }

        pub fn push_err(&self, err: Error) -> &Self {
            self.state.responses.lock().unwrap().push_back(Err(err));
            self
        }

        pub fn calls(&self) -> Vec<(PathBuf, Vec<String>, Option<Vec<u8>>)> {
            self.state.calls.lock().unwrap().clone()
        }

        /// Rendered command lines, for compact assertions.
        pub fn call_lines(&self) -> Vec<String> {
            self.calls()
                .iter()
                .map(|(binary, args, _)| {
                    format!("{} {}", binary.display(), args.join(" "))
                        .trim_end()
                        .to_string()
                })
                .collect()
        }
    }

    #[async_trait]
    impl Exec for MockExec {
        async fn run(&self, binary: &Path, args: &[String], opts: ExecOpts) -> Result<ExecOutput> {
            self.state.calls.lock().unwrap().push((
                binary.to_path_buf(),
                args.to_vec(),
                opts.stdin.clone(),
            ));
            let queued = self.state.responses.lock().unwrap().pop_front();
            let output = queued.unwrap_or_else(|| Ok(ExecOutput::default()))?;
            if let Some(sink) = &opts.line_sink {
                for line in output.stdout.lines() {
                    let _ = sink.send(line.to_string()).await;
                }
            }
            Ok(output)
        }
    }

    #[tokio::test]
    async fn captures_output() {
        let output = DefaultExec
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo out; echo err >&2".to_string()],
                ExecOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_ok() {
        let output = DefaultExec
            .run(
                Path::new("sh"),
                &["-c".to_string(), "exit 3".to_string()],
                ExecOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
    }

    #[tokio::test]
    async fn missing_binary_is_backend_unavailable() {
        let err = DefaultExec
            .run(Path::new("/does/not/exist"), &[], ExecOpts::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BackendUnavailable);
    }

    #[tokio::test]
    async fn stdin_is_delivered() {
        let opts = ExecOpts {
            stdin: Some(b"hello from stdin".to_vec()),
            ..ExecOpts::default()
        };
        let output = DefaultExec
            .run(Path::new("cat"), &[], opts)
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello from stdin");
    }

    #[tokio::test]
    async fn timeout_returns_partial_output() {
        let opts = ExecOpts {
            timeout: Some(Duration::from_millis(300)),
            ..ExecOpts::default()
        };
        let err = DefaultExec
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo early; sleep 30".to_string()],
                opts,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
        assert_eq!(err.stdout(), Some("early\n"));
    }

    #[tokio::test]
    async fn cancel_token_signalling() {
        let (handle, token) = cancellation();
        assert!(!token.is_cancelled());
        handle.cancel();
        assert!(token.is_cancelled());
        // resolves immediately once fired
        token.cancelled().await;
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let (handle, token) = cancellation();
        let opts = ExecOpts {
            cancel: Some(token),
            ..ExecOpts::default()
        };
        let args = vec!["-c".to_string(), "echo early; sleep 30".to_string()];
        let task = tokio::spawn(async move {
            DefaultExec.run(Path::new("sh"), &args, opts).await
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Cancelled);
        assert_eq!(err.stdout(), Some("early\n"));
    }

    #[tokio::test]
    async fn lines_stream_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let opts = ExecOpts {
            line_sink: Some(tx),
            ..ExecOpts::default()
        };
        let output = DefaultExec
            .run(
                Path::new("sh"),
                &["-c".to_string(), "echo one; echo two; echo three".to_string()],
                opts,
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, "one\ntwo\nthree\n");

        let mut seen = Vec::new();
        while let Some(line) = rx.recv().await {
            seen.push(line);
        }
        assert_eq!(seen, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn mock_records_and_replays() {
        let mock = MockExec::new();
        mock.push_ok("first").push_exit(1, "bad");

        let one = mock
            .run(Path::new("docker"), &["ps".to_string()], ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(one.stdout, "first");

        let two = mock
            .run(Path::new("docker"), &["rm".to_string()], ExecOpts::default())
            .await
            .unwrap();
        assert_eq!(two.exit_code, 1);

        assert_eq!(
            mock.call_lines(),
            vec!["docker ps".to_string(), "docker rm".to_string()]
        );
    }
}
