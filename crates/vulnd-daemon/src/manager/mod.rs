//! Worker lifecycle manager.
//!
//! Owns the orchestrator side of every scan: forks an isolated worker per
//! job, enforces the whole-job wall-clock timeout, mirrors worker IPC into
//! the registry, classifies child exits (normal / timeout / out-of-memory /
//! unknown) and settles each job exactly once so the queue can never leak a
//! concurrency slot.

mod ring;

pub use ring::RingBuffer;

use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use vulnd_core::ipc::{self, FrameCodec, WorkerEvent, WorkerRequest};
use vulnd_core::queue::JobQueue;
use vulnd_core::registry::ScanRegistry;
use vulnd_core::scan::{ScanError, ScanId, ScanJob};

use crate::sandbox::{self, WORKER_CHANNEL_FD};

/// Registry handle shared across the daemon, mutated only under its mutex.
pub type SharedRegistry = Arc<Mutex<ScanRegistry>>;

/// Queue handle shared across the daemon, mutated only under its mutex.
pub type SharedQueue = Arc<Mutex<JobQueue>>;

/// Bytes of worker stderr retained for exit classification.
pub const STDERR_CAPTURE_BYTES: usize = 4096;

/// Stderr substrings that identify a heap-exhausted worker. The Rust
/// allocator prints `memory allocation of N bytes failed` before aborting;
/// `out of memory` covers allocator shims and libc.
const OOM_FINGERPRINTS: [&str; 2] = ["memory allocation of", "out of memory"];

/// Per-job worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Worker command line (program + args). Defaults to re-executing the
    /// daemon binary in `worker` mode; injectable for tests.
    pub worker_cmd: Vec<String>,

    /// Address-space cap applied to the child, strictly below the service
    /// memory ceiling so the worker hits a recoverable allocation failure
    /// before the OS kills it.
    pub heap_limit_bytes: u64,

    /// Whole-job wall-clock timeout.
    pub timeout: Duration,
}

/// Manager errors (spawn-time; everything later is classified onto the
/// scan record instead).
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The configured worker command is empty.
    #[error("empty worker command")]
    EmptyWorkerCommand,

    /// Creating the IPC socketpair failed.
    #[error("failed to create worker channel: {0}")]
    Channel(std::io::Error),

    /// The worker process could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(std::io::Error),
}

/// One-shot latch for a job's terminal transition.
///
/// The timer, the exit handler and the channel-error handler all race to
/// settle; only the first firing releases the queue slot.
#[derive(Debug, Default)]
struct SettleLatch {
    done: bool,
}

impl SettleLatch {
    /// Returns `true` exactly once, on the first call.
    fn fire(&mut self) -> bool {
        !std::mem::replace(&mut self.done, true)
    }

    const fn is_done(&self) -> bool {
        self.done
    }
}

struct SpawnedWorker {
    child: tokio::process::Child,
    channel: tokio::net::UnixStream,
    stderr_ring: Arc<Mutex<RingBuffer>>,
    stderr_task: tokio::task::JoinHandle<()>,
}

/// Forks and supervises one isolated worker per job.
pub struct WorkerManager {
    registry: SharedRegistry,
    queue: SharedQueue,
    config: WorkerConfig,

    /// Live children by scan ID, for cooperative shutdown.
    live: Mutex<HashMap<ScanId, Pid>>,
}

impl WorkerManager {
    /// Create a manager over the shared registry and queue.
    #[must_use]
    pub fn new(registry: SharedRegistry, queue: SharedQueue, config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            queue,
            config,
            live: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live worker processes.
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Run one job in an isolated worker. Fire-and-forget: spawns the
    /// supervision task and returns immediately.
    ///
    /// Exactly one queue slot release is guaranteed per call, on every
    /// path: spawn failure, timeout, crash, or normal exit.
    pub fn run_job(self: &Arc<Self>, job: ScanJob) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.supervise(job).await;
        });
    }

    /// Send SIGTERM to every live worker, await exits, and SIGKILL any
    /// survivor once the grace period expires. Returns when no live
    /// workers remain (or shortly after the force-kill).
    pub async fn shutdown_workers(&self, grace: Duration) {
        let workers: Vec<(ScanId, Pid)> = self
            .live
            .lock()
            .unwrap()
            .iter()
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();

        if workers.is_empty() {
            return;
        }

        info!(workers = workers.len(), "shutting down live workers");
        for (scan_id, pid) in &workers {
            if let Err(error) = signal::kill(*pid, Signal::SIGTERM) {
                debug!(scan_id = %scan_id, %error, "SIGTERM delivery failed (worker likely gone)");
            }
        }

        let deadline = tokio::time::Instant::now() + grace;
        self.await_live_empty(deadline).await;

        let survivors: Vec<(ScanId, Pid)> = self
            .live
            .lock()
            .unwrap()
            .iter()
            .map(|(id, pid)| (id.clone(), *pid))
            .collect();

        if survivors.is_empty() {
            return;
        }

        warn!(survivors = survivors.len(), "grace expired; force-killing workers");
        for (scan_id, pid) in &survivors {
            if let Err(error) = signal::kill(*pid, Signal::SIGKILL) {
                debug!(scan_id = %scan_id, %error, "SIGKILL delivery failed (worker likely gone)");
            }
        }

        // SIGKILL cannot be resisted; allow a short reap window.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        self.await_live_empty(deadline).await;
    }

    async fn await_live_empty(&self, deadline: tokio::time::Instant) {
        while tokio::time::Instant::now() < deadline {
            if self.live.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// The supervision task body: one per job.
    async fn supervise(self: Arc<Self>, job: ScanJob) {
        let scan_id = job.scan_id.clone();
        let mut latch = SettleLatch::default();

        let spawned = match self.spawn_worker() {
            Ok(spawned) => spawned,
            Err(error) => {
                warn!(scan_id = %scan_id, %error, "worker spawn failed");
                self.registry
                    .lock()
                    .unwrap()
                    .set_error(&scan_id, ScanError::worker_process(&error));
                self.settle(&scan_id, &mut latch);
                return;
            },
        };

        let SpawnedWorker {
            mut child,
            channel,
            stderr_ring,
            stderr_task,
        } = spawned;

        #[allow(clippy::cast_possible_wrap)] // PIDs fit in i32
        if let Some(pid) = child.id() {
            self.live
                .lock()
                .unwrap()
                .insert(scan_id.clone(), Pid::from_raw(pid as i32));
        }

        debug!(scan_id = %scan_id, pid = child.id(), "worker spawned");

        let mut framed = Framed::new(channel, FrameCodec::new());

        // Exactly one start message per child, sent as soon as the channel
        // is open.
        let start = WorkerRequest::Start {
            scan_id: scan_id.clone(),
            repo_url: job.repo_url.clone(),
        };
        let send_result = match ipc::encode(&start) {
            Ok(frame) => framed.send(frame).await,
            Err(error) => Err(error),
        };
        if let Err(error) = send_result {
            warn!(scan_id = %scan_id, %error, "failed to send start message");
            self.registry
                .lock()
                .unwrap()
                .set_error(&scan_id, ScanError::worker_process(&error));
            self.settle(&scan_id, &mut latch);
            let _ = child.start_kill();
            let _ = child.wait().await;
            return;
        }

        let timeout = tokio::time::sleep(self.config.timeout);
        tokio::pin!(timeout);
        let mut timed_out = false;
        let mut ipc_open = true;

        let exit_status = loop {
            tokio::select! {
                () = &mut timeout, if !timed_out => {
                    timed_out = true;
                    warn!(
                        scan_id = %scan_id,
                        timeout_ms = self.config.timeout.as_millis() as u64,
                        "worker timed out; killing"
                    );
                    self.registry.lock().unwrap().set_error(
                        &scan_id,
                        ScanError::worker_timeout(self.config.timeout.as_millis()),
                    );
                    let _ = child.start_kill();
                    self.settle(&scan_id, &mut latch);
                },

                frame = framed.next(), if ipc_open => match frame {
                    Some(Ok(bytes)) => {
                        if latch.is_done() {
                            debug!(scan_id = %scan_id, "dropping IPC for settled job");
                        } else {
                            self.apply_frame(&scan_id, &bytes);
                        }
                    },
                    Some(Err(error)) => {
                        warn!(scan_id = %scan_id, %error, "worker channel error");
                        if !latch.is_done() {
                            self.registry
                                .lock()
                                .unwrap()
                                .set_error(&scan_id, ScanError::worker_process(&error));
                            self.settle(&scan_id, &mut latch);
                        }
                        ipc_open = false;
                    },
                    None => {
                        ipc_open = false;
                    },
                },

                status = child.wait() => {
                    break status;
                },
            }
        };

        // The exit can win the race against the worker's final frames,
        // which are still buffered in the socketpair; drain them before
        // classifying. Bounded, because a grandchild inheriting fd 3 could
        // otherwise hold the channel open indefinitely.
        if ipc_open {
            let drain = async {
                while let Some(frame) = framed.next().await {
                    match frame {
                        Ok(bytes) => {
                            if latch.is_done() {
                                debug!(scan_id = %scan_id, "dropping IPC for settled job");
                            } else {
                                self.apply_frame(&scan_id, &bytes);
                            }
                        },
                        Err(error) => {
                            warn!(scan_id = %scan_id, %error, "worker channel error during drain");
                            break;
                        },
                    }
                }
            };
            let _ = tokio::time::timeout(Duration::from_millis(250), drain).await;
        }

        // Grandchildren may hold the stderr pipe open past the worker's
        // exit, so this drain gets a bounded window too.
        let _ = tokio::time::timeout(Duration::from_millis(500), stderr_task).await;
        let stderr = stderr_ring.lock().unwrap().to_text();

        match exit_status {
            Err(error) => {
                if !latch.is_done() {
                    self.registry
                        .lock()
                        .unwrap()
                        .set_error(&scan_id, ScanError::worker_process(&error));
                }
                self.settle(&scan_id, &mut latch);
            },
            Ok(status) => {
                if latch.is_done() {
                    debug!(scan_id = %scan_id, ?status, "worker exited after settle");
                    return;
                }

                let terminal = self
                    .registry
                    .lock()
                    .unwrap()
                    .get(&scan_id)
                    .is_some_and(|record| record.status.is_terminal());

                if terminal {
                    // The worker reported its own outcome; nothing to add.
                    debug!(scan_id = %scan_id, ?status, "worker exited after reporting outcome");
                } else {
                    let error = classify_exit(status, &stderr);
                    warn!(scan_id = %scan_id, ?status, %error, "worker exited without reporting");
                    self.registry.lock().unwrap().set_error(&scan_id, error);
                }
                self.settle(&scan_id, &mut latch);
            },
        }
    }

    /// Idempotent settle: unregister the child and release the queue slot.
    fn settle(&self, scan_id: &ScanId, latch: &mut SettleLatch) {
        if !latch.fire() {
            return;
        }
        self.live.lock().unwrap().remove(scan_id);
        self.queue.lock().unwrap().on_job_complete();
        debug!(scan_id = %scan_id, "job settled");
    }

    /// Mirror one validated worker frame into the registry. Frames for
    /// other scans and unknown tags are dropped; malformed frames are
    /// rejected with a warning.
    fn apply_frame(&self, scan_id: &ScanId, frame: &[u8]) {
        match ipc::decode_event(frame) {
            Ok(Some(event)) => {
                if event.scan_id() != scan_id {
                    warn!(
                        expected = %scan_id,
                        received = %event.scan_id(),
                        "dropping IPC for mismatched scan"
                    );
                    return;
                }

                let mut registry = self.registry.lock().unwrap();
                match event {
                    WorkerEvent::Status { status, .. } => registry.update_status(scan_id, status),
                    WorkerEvent::Vulns {
                        vulnerabilities, ..
                    } => registry.append_vulnerabilities(scan_id, vulnerabilities),
                    WorkerEvent::Error { error, .. } => registry.set_error(scan_id, error),
                }
            },
            Ok(None) => debug!(scan_id = %scan_id, "ignoring unknown IPC tag"),
            Err(error) => warn!(scan_id = %scan_id, %error, "rejecting malformed IPC frame"),
        }
    }

    /// Spawn one worker with the sanitized environment, the heap cap, the
    /// fd-3 channel, and stderr piped into the capture ring.
    fn spawn_worker(&self) -> Result<SpawnedWorker, ManagerError> {
        let (parent_io, child_io) =
            std::os::unix::net::UnixStream::pair().map_err(ManagerError::Channel)?;

        let program = self
            .config
            .worker_cmd
            .first()
            .ok_or(ManagerError::EmptyWorkerCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(&self.config.worker_cmd[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        sandbox::sanitize_env(&mut cmd);

        let heap_limit = self.config.heap_limit_bytes;
        let channel_fd = child_io.as_raw_fd();
        // SAFETY: the closure runs post-fork/pre-exec in the child and only
        // calls async-signal-safe libc wrappers (dup2, setrlimit).
        unsafe {
            cmd.pre_exec(move || {
                // dup2 clears CLOEXEC on the duplicate, so the channel
                // survives exec as fd 3 while the original end closes.
                nix::unistd::dup2(channel_fd, WORKER_CHANNEL_FD)
                    .map_err(std::io::Error::from)?;
                setrlimit(Resource::RLIMIT_AS, heap_limit, heap_limit)
                    .map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(ManagerError::Spawn)?;
        drop(child_io);

        let stderr_ring = Arc::new(Mutex::new(RingBuffer::new(STDERR_CAPTURE_BYTES)));
        let stderr_task = match child.stderr.take() {
            Some(mut stderr) => {
                let ring = Arc::clone(&stderr_ring);
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stderr.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => ring.lock().unwrap().push(&buf[..n]),
                        }
                    }
                })
            },
            None => tokio::spawn(async {}),
        };

        parent_io
            .set_nonblocking(true)
            .map_err(ManagerError::Channel)?;
        let channel =
            tokio::net::UnixStream::from_std(parent_io).map_err(ManagerError::Channel)?;

        Ok(SpawnedWorker {
            child,
            channel,
            stderr_ring,
            stderr_task,
        })
    }
}

/// Classify a worker exit that happened before any outcome was reported.
///
/// Heap exhaustion leaves an allocator fingerprint on stderr. A SIGKILL
/// without that fingerprint - and the manager's own timer settles before
/// classification, so it never reaches here - means the OS killed the
/// worker from outside, most likely a container OOM kill.
fn classify_exit(status: ExitStatus, stderr: &str) -> ScanError {
    if OOM_FINGERPRINTS
        .iter()
        .any(|fingerprint| stderr.contains(fingerprint))
    {
        return ScanError::worker_oom_heap();
    }

    if status.signal() == Some(Signal::SIGKILL as i32) {
        return ScanError::worker_oom_killed();
    }

    ScanError::worker_exit(status.code(), status.signal())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vulnd_core::scan::ScanErrorCode;

    fn exit_with_code(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn killed_by(signal: i32) -> ExitStatus {
        ExitStatus::from_raw(signal)
    }

    #[test]
    fn settle_latch_fires_once() {
        let mut latch = SettleLatch::default();
        assert!(!latch.is_done());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_done());
    }

    #[test]
    fn allocator_fingerprint_classifies_as_heap_oom() {
        let stderr = "memory allocation of 52428800 bytes failed\n";
        let error = classify_exit(killed_by(6), stderr);
        assert_eq!(error.code, ScanErrorCode::Oom);
        assert!(error.message.contains("heap limit"));
    }

    #[test]
    fn sigkill_without_fingerprint_classifies_as_os_oom() {
        let error = classify_exit(killed_by(Signal::SIGKILL as i32), "");
        assert_eq!(error.code, ScanErrorCode::Oom);
        assert!(error.message.contains("killed by the OS"));
    }

    #[test]
    fn other_exits_classify_as_unknown() {
        let error = classify_exit(exit_with_code(3), "some unrelated noise");
        assert_eq!(error.code, ScanErrorCode::Unknown);
        assert!(error.message.contains("code=3"));

        let error = classify_exit(killed_by(Signal::SIGTERM as i32), "");
        assert_eq!(error.code, ScanErrorCode::Unknown);
        assert!(error.message.contains("signal=15"));
    }
}
