//! Shared helpers for the daemon integration tests.

#![allow(dead_code)] // not every test file uses every helper

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use vulnd_core::queue::{JobQueue, Processor, QueueConfig};
use vulnd_core::registry::{RegistryConfig, ScanRegistry};
use vulnd_core::scan::{ScanId, ScanJob, ScanRecord};

use vulnd_daemon::manager::{SharedQueue, SharedRegistry, WorkerConfig, WorkerManager};

/// Heap cap for scripted fake workers; generous, the cap itself is
/// exercised by classification tests rather than by real exhaustion.
pub const TEST_HEAP_LIMIT: u64 = 1024 * 1024 * 1024;

/// A composed registry + queue + manager, wired like the daemon's
/// composition root but with an injectable worker command.
pub struct Harness {
    pub registry: SharedRegistry,
    pub queue: SharedQueue,
    pub manager: Arc<WorkerManager>,
}

impl Harness {
    /// Build the harness with the given worker command and job timeout.
    pub fn new(worker_cmd: Vec<String>, timeout: Duration, max_concurrent: usize) -> Self {
        let registry = Arc::new(Mutex::new(ScanRegistry::new(RegistryConfig {
            max_entries: 50,
            max_vulns_per_scan: 10_000,
        })));
        let queue = Arc::new(Mutex::new(JobQueue::new(QueueConfig {
            max_queued: 10,
            max_concurrent,
        })));

        let manager = WorkerManager::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            WorkerConfig {
                worker_cmd,
                heap_limit_bytes: TEST_HEAP_LIMIT,
                timeout,
            },
        );

        let processor: Processor = {
            let manager = Arc::clone(&manager);
            Arc::new(move |job| {
                manager.run_job(job);
                Ok(())
            })
        };
        queue.lock().unwrap().set_processor(processor);

        Self {
            registry,
            queue,
            manager,
        }
    }

    /// Create a registry record and enqueue its job, as the control plane
    /// would.
    pub fn start_scan(&self, scan_id: &str, repo_url: &str) {
        let scan_id = ScanId::from(scan_id);
        self.registry
            .lock()
            .unwrap()
            .create(scan_id.clone(), repo_url.to_string())
            .expect("duplicate scan id in test");
        let admitted = self.queue.lock().unwrap().enqueue(ScanJob {
            scan_id,
            repo_url: repo_url.to_string(),
        });
        assert!(admitted, "test queue unexpectedly full");
    }

    pub fn record(&self, scan_id: &str) -> Option<ScanRecord> {
        self.registry.lock().unwrap().get(&ScanId::from(scan_id))
    }

    pub fn active(&self) -> usize {
        self.queue.lock().unwrap().active()
    }
}

/// Poll until `cond` holds or the timeout expires.
pub async fn wait_for(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Write a shell script into `dir` and return a worker command that runs
/// it via `/bin/sh`.
pub fn sh_worker(dir: &Path, name: &str, body: &str) -> Vec<String> {
    let path = write_script(dir, name, body);
    vec!["/bin/sh".to_string(), path.to_string_lossy().into_owned()]
}

/// Write a script file (no exec bit needed when run via `sh`).
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("failed to write test script");
    path
}

/// Write an executable script (for binaries invoked directly, like the
/// fake git/trivy).
pub fn executable_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = write_script(dir, name, body);
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// Shell lines that write the given IPC events as length-prefixed JSON
/// frames to fd 3, the worker channel.
pub fn frame_emitting_lines(events: &[serde_json::Value]) -> String {
    let mut lines = String::new();
    for event in events {
        let payload = event.to_string();
        assert!(
            !payload.contains('\''),
            "frame payload must not contain single quotes: {payload}"
        );
        let header: String = u32::try_from(payload.len())
            .unwrap()
            .to_be_bytes()
            .iter()
            .map(|byte| format!("\\{byte:03o}"))
            .collect();
        lines.push_str(&format!("printf '{header}' >&3\n"));
        lines.push_str(&format!("printf '%s' '{payload}' >&3\n"));
    }
    lines
}
