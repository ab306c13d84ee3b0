//! The guest payload pipeline.
//!
//! Two halves: staging the interpreter binary into a running instance
//! (`deploy`), and running a script through it (`execute`). Scripts travel
//! over stdin so no residue lands in the guest; for backends whose exec
//! primitive has no stdin pipe, a temporary script file is pushed, executed
//! and deleted even on failure. Progress checkpoints are scraped from the
//! live stdout stream and forwarded, in arrival order, to the caller's
//! channel; a slow consumer back-pressures the guest process.

use crate::{
    checkpoint::{self, CheckpointRecord},
    driver::{CancelToken, Driver, ExecOpts, ExecOutput},
    error::{Error, ErrorKind, Result},
    security::Security,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tokio::sync::mpsc;

/// Default guest path for the staged interpreter.
pub const DEFAULT_REXX_PATH: &str = "/usr/local/bin/rexx";

/// Capacity of the internal line channel; small on purpose so a slow
/// progress consumer stalls the reader instead of buffering unboundedly.
const LINE_CHANNEL_CAPACITY: usize = 16;

static SCRIPT_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug, Serialize)]
/// Timing and throughput of one staging run.
pub struct DeployOutcome {
    pub remote_path: String,
    pub bytes: u64,
    pub elapsed_ms: u64,
    pub throughput_mb_s: f64,
}

/// Stage the interpreter binary into a running instance. The gate validates
/// (and audits) the binary first; any failure past the upload rolls the
/// partial file back.
pub async fn deploy(
    driver: &dyn Driver,
    security: &Security,
    name: &str,
    binary: &Path,
    target: &str,
    cancel: Option<CancelToken>,
) -> Result<DeployOutcome> {
    security.check_binary(binary)?;

    let bytes = tokio::fs::metadata(binary)
        .await
        .map_err(|_| {
            Error::invalid_argument(format!("binary {} does not exist", binary.display()))
        })?
        .len();

    let started = Instant::now();
    driver.copy_to(name, binary, target).await?;

    let chmod = driver
        .exec(
            name,
            &["chmod".to_string(), "+x".to_string(), target.to_string()],
            ExecOpts {
                cancel,
                ..ExecOpts::default()
            },
        )
        .await;
    match chmod {
        Ok(output) if output.success() => {}
        outcome => {
            warn!("chmod of staged binary failed, rolling back {}", target);
            let _ = driver
                .exec(
                    name,
                    &["rm".to_string(), "-f".to_string(), target.to_string()],
                    ExecOpts::default(),
                )
                .await;
            return Err(match outcome {
                Ok(output) => Error::new(
                    ErrorKind::IoError,
                    format!("chmod +x {} failed in guest", target),
                )
                .with_output(output.stdout, output.stderr),
                Err(err) => err,
            });
        }
    }

    let elapsed_ms = started.elapsed().as_millis() as u64;
    let throughput_mb_s = if elapsed_ms == 0 {
        0.0
    } else {
        (bytes as f64 / (1024.0 * 1024.0)) / (elapsed_ms as f64 / 1000.0)
    };
    info!(
        "Deployed {} ({} bytes) to {}:{} in {}ms",
        binary.display(),
        bytes,
        name,
        target,
        elapsed_ms
    );
    Ok(DeployOutcome {
        remote_path: target.to_string(),
        bytes,
        elapsed_ms,
        throughput_mb_s,
    })
}

/// Run a script through the staged interpreter, capturing output and
/// streaming checkpoints to `progress` when supplied.
pub async fn execute(
    driver: &dyn Driver,
    security: &Security,
    name: &str,
    rexx_path: &str,
    script: &str,
    timeout: Option<Duration>,
    progress: Option<mpsc::Sender<CheckpointRecord>>,
    cancel: Option<CancelToken>,
) -> Result<ExecOutput> {
    let violations = security.check_command(script);
    if !violations.is_empty() {
        return Err(Error::policy_denied(violations.join("; ")));
    }

    let wrapped = checkpoint::wrap_with_checkpoints(script, progress.is_some());

    // checkpoints are scraped off the live line stream, not the final buffer
    let (line_sink, forwarder) = match progress {
        Some(records) => {
            let (tx, mut rx) = mpsc::channel::<String>(LINE_CHANNEL_CAPACITY);
            let task = tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    if let Some(record) = checkpoint::scan_line(&line) {
                        // a consumer that went away just stops the stream
                        let _ = records.send(record).await;
                    }
                }
            });
            (Some(tx), Some(task))
        }
        None => (None, None),
    };

    let result = if driver.stdin_capable() {
        let opts = ExecOpts {
            stdin: Some(wrapped.clone().into_bytes()),
            timeout,
            line_sink,
            cancel,
            ..ExecOpts::default()
        };
        driver
            .exec(
                name,
                &[rexx_path.to_string(), "/dev/stdin".to_string()],
                opts,
            )
            .await
    } else {
        execute_via_temp_file(driver, name, rexx_path, &wrapped, timeout, line_sink, cancel).await
    };

    if let Some(task) = forwarder {
        // all line senders are gone once exec returned; wait for the tail
        let _ = task.await;
    }
    result
}

/// Fallback for backends whose exec primitive cannot pipe stdin: push the
/// script as a guest temp file, run it, and delete it even when the run
/// fails.
async fn execute_via_temp_file(
    driver: &dyn Driver,
    name: &str,
    rexx_path: &str,
    script: &str,
    timeout: Option<Duration>,
    line_sink: Option<mpsc::Sender<String>>,
    cancel: Option<CancelToken>,
) -> Result<ExecOutput> {
    let serial = SCRIPT_COUNTER.fetch_add(1, Ordering::SeqCst);
    let host_path = std::env::temp_dir().join(format!(
        "corral-script-{}-{}.rexx",
        std::process::id(),
        serial
    ));
    let guest_path = format!("/tmp/corral-script-{}.rexx", serial);

    tokio::fs::write(&host_path, script).await?;
    let pushed = driver.copy_to(name, &host_path, &guest_path).await;
    let _ = tokio::fs::remove_file(&host_path).await;
    pushed?;

    let opts = ExecOpts {
        timeout,
        line_sink,
        cancel,
        ..ExecOpts::default()
    };
    let result = driver
        .exec(name, &[rexx_path.to_string(), guest_path.clone()], opts)
        .await;

    // deletion happens on success, failure, timeout and cancellation alike,
    // so it deliberately runs without the caller's token
    let _ = driver
        .exec(
            name,
            &["rm".to_string(), "-f".to_string(), guest_path],
            ExecOpts::default(),
        )
        .await;
    debug!("Removed fallback script file for {}", name);
    result
}

/// Remove a staged interpreter from the guest.
pub async fn cleanup(driver: &dyn Driver, name: &str, rexx_path: &str) -> Result<()> {
    let output = driver
        .exec(
            name,
            &["rm".to_string(), "-f".to_string(), rexx_path.to_string()],
            ExecOpts::default(),
        )
        .await?;
    if output.success() {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::IoError,
            format!("failed to remove {} from {}", rexx_path, name),
        )
        .with_output(output.stdout, output.stderr))
    }
}

/// Pick the guest path for a binary, honoring an explicit `target_path=`.
pub fn target_path(explicit: Option<&str>, configured: &str) -> String {
    match explicit {
        Some(path) if !path.is_empty() => path.to_string(),
        _ => configured.to_string(),
    }
}

/// Resolve the script text from inline `script=` or host-side `script_file=`.
pub async fn resolve_script(
    inline: Option<&str>,
    script_file: Option<&str>,
) -> Result<String> {
    match (inline, script_file) {
        (Some(script), _) if !script.is_empty() => Ok(script.to_string()),
        (_, Some(file)) if !file.is_empty() => {
            tokio::fs::read_to_string(PathBuf::from(file)).await.map_err(|_| {
                Error::invalid_argument(format!("script file {:?} is not readable", file))
            })
        }
        _ => Err(Error::invalid_argument(
            "either script= or script_file= is required",
        )),
    }
}
