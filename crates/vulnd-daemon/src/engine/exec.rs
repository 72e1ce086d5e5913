//! Bounded subprocess execution for the engine pipeline.
//!
//! Both external binaries (the clone tool and the scanner) run through
//! [`run_command`]: sanitized environment, per-operation timeout, and
//! size-capped output capture so a chatty child can never blow the worker's
//! memory budget.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::sandbox;

/// Captured result of a finished subprocess.
#[derive(Debug)]
pub struct CommandOutput {
    /// Exit status.
    pub status: ExitStatus,

    /// Captured stdout (lossy UTF-8, capped).
    pub stdout: String,

    /// Captured stderr (lossy UTF-8, capped).
    pub stderr: String,

    /// `true` when either stream exceeded the capture cap.
    pub truncated: bool,
}

/// Subprocess execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The binary could not be spawned (missing, not executable, ...).
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The per-operation timeout expired; the child was killed.
    #[error("'{program}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Program that was killed.
        program: String,
        /// The expired budget.
        timeout_ms: u64,
    },

    /// I/O failure while waiting on the child.
    #[error("I/O error while running '{program}': {source}")]
    Io {
        /// Program being waited on.
        program: String,
        /// Underlying OS error.
        source: std::io::Error,
    },
}

impl ExecError {
    /// `true` when the failure is a missing binary.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Run a program to completion with a sanitized environment, a wall-clock
/// timeout, and capped output capture.
///
/// # Errors
///
/// Returns [`ExecError::Spawn`] when the program cannot start,
/// [`ExecError::Timeout`] when the budget expires (the child is killed
/// first), and [`ExecError::Io`] on wait failures. A non-zero exit is not
/// an error here; callers classify it from the returned output.
pub async fn run_command(
    program: &str,
    args: &[&str],
    extra_env: &[(&str, &str)],
    timeout: Duration,
    max_buffer: usize,
) -> Result<CommandOutput, ExecError> {
    debug!(program, ?args, "running external command");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    sandbox::sanitize_env(&mut cmd);
    for (name, value) in extra_env {
        cmd.env(name, value);
    }

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: program.to_string(),
        source,
    })?;

    // Drain both pipes concurrently with the wait: a child that writes more
    // than the pipe buffer would otherwise deadlock against us.
    let stdout_task = capture_task(child.stdout.take(), max_buffer);
    let stderr_task = capture_task(child.stderr.take(), max_buffer);

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => status,
        Ok(Err(source)) => {
            let _ = child.start_kill();
            return Err(ExecError::Io {
                program: program.to_string(),
                source,
            });
        },
        Err(_) => {
            warn!(program, timeout_ms = timeout.as_millis() as u64, "command timed out; killing");
            let _ = child.start_kill();
            let _ = child.wait().await;
            #[allow(clippy::cast_possible_truncation)] // budgets are far below u64 millis
            return Err(ExecError::Timeout {
                program: program.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        },
    };

    let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

    Ok(CommandOutput {
        status,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        truncated: stdout_truncated || stderr_truncated,
    })
}

/// Spawn a task that drains one pipe, retaining at most `cap` bytes.
///
/// The stream keeps being consumed after the cap so the child never blocks
/// on a full pipe; only retention stops.
fn capture_task<R>(
    stream: Option<R>,
    cap: usize,
) -> tokio::task::JoinHandle<(Vec<u8>, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(mut stream) = stream else {
            return (Vec::new(), false);
        };

        let mut retained = Vec::new();
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let room = cap.saturating_sub(retained.len());
                    if n > room {
                        truncated = true;
                    }
                    retained.extend_from_slice(&buf[..n.min(room)]);
                },
            }
        }
        (retained, truncated)
    })
}
