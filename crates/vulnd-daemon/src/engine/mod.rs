//! Scan pipeline, run inside the isolated worker process.
//!
//! One job per process: clone the repository shallowly, run the external
//! scanner against the checkout, stream-parse the report through the
//! severity filter, and emit batches plus status transitions over the
//! worker channel. The per-job temp directory is removed on every exit
//! path, the worker emits exactly one `Finished` *or* one `error`, and the
//! process exits 0 afterwards so the manager can tell reported failures
//! from silent crashes.

pub mod exec;
pub mod parse;

use std::path::Path;
use std::time::Duration;

use futures::SinkExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use vulnd_core::config::Config;
use vulnd_core::ipc::{self, FrameCodec, IpcError, WorkerEvent};
use vulnd_core::scan::{ScanError, ScanErrorCode, ScanId, ScanStatus, Vulnerability};

use exec::{CommandOutput, ExecError};
use parse::ParseError;

/// Name of the scanner report inside the per-job temp directory.
const REPORT_FILE: &str = "report.json";

/// How much stderr to quote in classified error messages.
const STDERR_EXCERPT_LEN: usize = 400;

/// Engine configuration, fixed for the life of one worker.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Clone binary. Resolved on `PATH`.
    pub git_bin: String,

    /// Scanner binary. Resolved on `PATH`.
    pub trivy_bin: String,

    /// Clone-step timeout.
    pub clone_timeout: Duration,

    /// Scanner-step timeout.
    pub scan_timeout: Duration,

    /// Cap on records per `vulns` IPC message.
    pub vuln_batch_size: usize,

    /// Cap on captured subprocess output.
    pub exec_max_buffer: usize,
}

impl EngineConfig {
    /// Derive the engine configuration from the daemon configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            git_bin: "git".to_string(),
            trivy_bin: "trivy".to_string(),
            clone_timeout: config.clone_timeout,
            scan_timeout: config.scan_timeout,
            vuln_batch_size: config.vuln_batch_size,
            exec_max_buffer: config.exec_max_buffer,
        }
    }
}

/// Outgoing half of the worker channel, keyed to one scan.
pub struct EventSink {
    framed: Framed<tokio::net::UnixStream, FrameCodec>,
    scan_id: ScanId,
}

impl EventSink {
    /// Wrap an already-framed channel for one scan.
    #[must_use]
    pub fn new(framed: Framed<tokio::net::UnixStream, FrameCodec>, scan_id: ScanId) -> Self {
        Self { framed, scan_id }
    }

    /// Emit a status transition.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError`] when the channel is gone.
    pub async fn status(&mut self, status: ScanStatus) -> Result<(), IpcError> {
        let event = WorkerEvent::Status {
            scan_id: self.scan_id.clone(),
            status,
        };
        self.send(&event).await
    }

    /// Emit one batch of vulnerabilities.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError`] when the channel is gone.
    pub async fn vulns(&mut self, vulnerabilities: Vec<Vulnerability>) -> Result<(), IpcError> {
        let event = WorkerEvent::Vulns {
            scan_id: self.scan_id.clone(),
            vulnerabilities,
        };
        self.send(&event).await
    }

    /// Emit the terminal error report.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError`] when the channel is gone.
    pub async fn error(&mut self, error: ScanError) -> Result<(), IpcError> {
        let event = WorkerEvent::Error {
            scan_id: self.scan_id.clone(),
            error,
        };
        self.send(&event).await
    }

    async fn send(&mut self, event: &WorkerEvent) -> Result<(), IpcError> {
        let frame = ipc::encode(event)?;
        self.framed.send(frame).await
    }
}

/// Which external step failed, for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Clone,
    Scan,
}

/// Internal pipeline outcome: a classified scan failure (reported over
/// IPC) or a dead channel (nothing left to report to).
enum PipelineError {
    Scan(ScanError),
    Ipc(IpcError),
}

/// Run the full pipeline for one scan and report the outcome over the
/// sink.
///
/// Every classified failure is emitted as an `error` event and `Ok(())` is
/// returned; the only `Err` here is a dead channel.
///
/// # Errors
///
/// Returns [`IpcError`] when the worker channel fails mid-scan.
pub async fn run_scan(
    sink: &mut EventSink,
    repo_url: &str,
    config: &EngineConfig,
) -> Result<(), IpcError> {
    sink.status(ScanStatus::Scanning).await?;

    match execute(sink, repo_url, config).await {
        Ok(delivered) => {
            info!(delivered, "scan finished");
            sink.status(ScanStatus::Finished).await
        },
        Err(PipelineError::Scan(error)) => {
            warn!(%error, "scan failed");
            sink.error(error).await
        },
        Err(PipelineError::Ipc(error)) => Err(error),
    }
}

/// Clone, scan, stream-parse. The temp directory is removed on every path
/// out of this function via RAII; removal failures are best-effort.
async fn execute(
    sink: &mut EventSink,
    repo_url: &str,
    config: &EngineConfig,
) -> Result<u64, PipelineError> {
    let workspace = tempfile::tempdir().map_err(|error| {
        PipelineError::Scan(classify_io_failure(Step::Clone, &error.to_string()))
    })?;
    let repo_dir = workspace.path().join("repo");
    let report_path = workspace.path().join(REPORT_FILE);

    clone_repository(repo_url, &repo_dir, config)
        .await
        .map_err(PipelineError::Scan)?;

    run_scanner(&repo_dir, &report_path, config)
        .await
        .map_err(PipelineError::Scan)?;

    stream_report(sink, &report_path, config).await
}

/// Shallow, single-branch, tag-free clone into the per-job temp directory,
/// with interactive credential prompts disabled.
async fn clone_repository(
    repo_url: &str,
    repo_dir: &Path,
    config: &EngineConfig,
) -> Result<(), ScanError> {
    let repo_dir = repo_dir.to_string_lossy().into_owned();
    debug!(repo_url, "cloning repository");

    let output = exec::run_command(
        &config.git_bin,
        &[
            "clone",
            "--depth",
            "1",
            "--single-branch",
            "--no-tags",
            repo_url,
            repo_dir.as_str(),
        ],
        &[("GIT_TERMINAL_PROMPT", "0")],
        config.clone_timeout,
        config.exec_max_buffer,
    )
    .await
    .map_err(|error| classify_exec_error(Step::Clone, &error))?;

    if !output.status.success() {
        return Err(classify_step_failure(Step::Clone, &output));
    }
    Ok(())
}

/// Run the scanner against the checkout: JSON output to the report path,
/// CRITICAL only, vulnerability scanners only, quiet.
async fn run_scanner(
    repo_dir: &Path,
    report_path: &Path,
    config: &EngineConfig,
) -> Result<(), ScanError> {
    let repo_dir = repo_dir.to_string_lossy().into_owned();
    let report_path = report_path.to_string_lossy().into_owned();
    debug!("running scanner");

    let output = exec::run_command(
        &config.trivy_bin,
        &[
            "fs",
            "--format",
            "json",
            "--output",
            report_path.as_str(),
            "--severity",
            "CRITICAL",
            "--scanners",
            "vuln",
            "--quiet",
            repo_dir.as_str(),
        ],
        &[],
        config.scan_timeout,
        config.exec_max_buffer,
    )
    .await
    .map_err(|error| classify_exec_error(Step::Scan, &error))?;

    if !output.status.success() {
        return Err(classify_step_failure(Step::Scan, &output));
    }
    Ok(())
}

/// Stream the report through the severity filter into capped batches on
/// the sink.
///
/// The parser runs on a blocking thread and hands batches over a small
/// channel, so the worker never holds more than one token window plus one
/// in-flight batch.
async fn stream_report(
    sink: &mut EventSink,
    report_path: &Path,
    config: &EngineConfig,
) -> Result<u64, PipelineError> {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Vec<Vulnerability>>(2);
    let path = report_path.to_path_buf();
    let batch_size = config.vuln_batch_size;

    let parser = tokio::task::spawn_blocking(move || -> Result<u64, ParseError> {
        let file = std::fs::File::open(&path)?;
        parse::parse_report(std::io::BufReader::new(file), batch_size, |batch| {
            tx.blocking_send(batch)
                .map_err(|_| "batch channel closed".to_string())
        })
    });

    while let Some(batch) = rx.recv().await {
        sink.vulns(batch).await.map_err(PipelineError::Ipc)?;
    }

    match parser.await {
        Ok(Ok(delivered)) => Ok(delivered),
        Ok(Err(error)) => Err(PipelineError::Scan(ScanError::new(
            ScanErrorCode::ParseFailed,
            format!("failed to parse scanner report: {error}"),
        ))),
        Err(join_error) => Err(PipelineError::Scan(ScanError::new(
            ScanErrorCode::ParseFailed,
            format!("report parser crashed: {join_error}"),
        ))),
    }
}

/// Classify a spawn/timeout/I/O failure of an external step.
fn classify_exec_error(step: Step, error: &ExecError) -> ScanError {
    if let ExecError::Timeout { .. } = error {
        return ScanError::new(ScanErrorCode::Timeout, error.to_string());
    }

    if step == Step::Scan && error.is_not_found() {
        return ScanError::new(
            ScanErrorCode::TrivyFailed,
            format!("{error}. Is it installed?"),
        );
    }

    match step {
        Step::Clone => ScanError::new(ScanErrorCode::CloneFailed, error.to_string()),
        Step::Scan => ScanError::new(ScanErrorCode::TrivyFailed, error.to_string()),
    }
}

/// Classify a non-zero exit of an external step from its stderr.
fn classify_step_failure(step: Step, output: &CommandOutput) -> ScanError {
    let stderr = output.stderr.to_lowercase();

    if stderr.contains("no space left on device") || stderr.contains("disk quota exceeded") {
        return ScanError::new(
            ScanErrorCode::DiskFull,
            format!("out of disk space: {}", excerpt(&output.stderr)),
        );
    }

    if step == Step::Scan && stderr.contains("not found") {
        return ScanError::new(
            ScanErrorCode::TrivyFailed,
            format!("{}. Is it installed?", excerpt(&output.stderr)),
        );
    }

    let code = match step {
        Step::Clone => ScanErrorCode::CloneFailed,
        Step::Scan => ScanErrorCode::TrivyFailed,
    };
    let verb = match step {
        Step::Clone => "clone failed",
        Step::Scan => "scanner failed",
    };
    ScanError::new(
        code,
        format!(
            "{verb} (exit {:?}): {}",
            output.status.code(),
            excerpt(&output.stderr)
        ),
    )
}

/// Classify a pre-step I/O failure (e.g. temp directory creation).
fn classify_io_failure(step: Step, detail: &str) -> ScanError {
    let lowered = detail.to_lowercase();
    if lowered.contains("no space left on device") || lowered.contains("disk quota exceeded") {
        return ScanError::new(ScanErrorCode::DiskFull, format!("out of disk space: {detail}"));
    }
    let code = match step {
        Step::Clone => ScanErrorCode::CloneFailed,
        Step::Scan => ScanErrorCode::TrivyFailed,
    };
    ScanError::new(code, detail.to_string())
}

/// First `STDERR_EXCERPT_LEN` characters of the captured stderr, trimmed.
fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    match trimmed.char_indices().nth(STDERR_EXCERPT_LEN) {
        Some((index, _)) => format!("{}...", &trimmed[..index]),
        None => trimmed.to_string(),
    }
}
