//! Worker-mode entrypoint.
//!
//! The daemon re-executes itself with the hidden `worker` subcommand for
//! each scan. The child adopts the IPC channel the manager installed on
//! fd 3, waits for the single start message, runs the engine pipeline, and
//! exits 0 - reported failures travel over the channel, so a non-zero exit
//! always means a silent crash.

use std::os::fd::FromRawFd;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use vulnd_core::config::Config;
use vulnd_core::ipc::{self, FrameCodec, WorkerRequest};

use crate::engine::{self, EngineConfig, EventSink};
use crate::sandbox::WORKER_CHANNEL_FD;

/// Run one scan as directed over the worker channel.
///
/// # Errors
///
/// Fails only when the channel itself is unusable (missing fd, closed or
/// failing mid-scan); every scan-level failure is reported over IPC
/// instead.
pub async fn run(config: &Config) -> Result<()> {
    let stream = adopt_channel().context("failed to adopt worker channel on fd 3")?;
    let mut framed = Framed::new(stream, FrameCodec::new());

    // Exactly one start message arrives per child; anything else seen
    // while waiting is dropped.
    let (scan_id, repo_url) = loop {
        let Some(frame) = framed.next().await else {
            bail!("worker channel closed before start message");
        };
        let frame = frame.context("failed to read start message")?;

        match ipc::decode_request(&frame) {
            Ok(Some(WorkerRequest::Start { scan_id, repo_url })) => break (scan_id, repo_url),
            Ok(None) => debug!("ignoring unknown message while waiting for start"),
            Err(error) => warn!(%error, "rejecting malformed frame while waiting for start"),
        }
    };

    info!(scan_id = %scan_id, repo_url = %repo_url, "worker starting scan");

    let engine_config = EngineConfig::from_config(config);
    let mut sink = EventSink::new(framed, scan_id);
    engine::run_scan(&mut sink, &repo_url, &engine_config)
        .await
        .context("worker channel failed mid-scan")?;

    Ok(())
}

/// Reopen the socketpair end the manager installed before exec.
fn adopt_channel() -> std::io::Result<tokio::net::UnixStream> {
    // SAFETY: fd 3 is the channel end dup2'd in by the manager before
    // exec; worker mode is only entered via the hidden subcommand, so the
    // fd is present and owned by no one else in this process.
    let stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(WORKER_CHANNEL_FD) };
    stream.set_nonblocking(true)?;
    tokio::net::UnixStream::from_std(stream)
}
