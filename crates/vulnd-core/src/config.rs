//! Daemon configuration.
//!
//! All knobs are read from the environment exactly once at startup;
//! unparsable values fall back to their compile-time defaults with a
//! warning rather than aborting the daemon.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Default control-socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/vulnd.sock";

/// Default cap on jobs waiting in the queue (`QUEUE_MAX_SIZE`).
pub const DEFAULT_QUEUE_MAX_SIZE: usize = 10;

/// Default cap on concurrent workers (`QUEUE_MAX_CONCURRENT`).
pub const DEFAULT_QUEUE_MAX_CONCURRENT: usize = 1;

/// Default cap on registry entries.
pub const DEFAULT_REGISTRY_MAX_ENTRIES: usize = 50;

/// Default per-scan vulnerability cap.
pub const DEFAULT_REGISTRY_MAX_VULNS_PER_SCAN: usize = 10_000;

/// Default whole-job worker timeout in milliseconds.
pub const DEFAULT_WORKER_TIMEOUT_MS: u64 = 480_000;

/// Default grace period for cooperative worker shutdown in milliseconds.
pub const DEFAULT_WORKER_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Default retry-after hint returned on queue-full rejections, in seconds.
pub const DEFAULT_RETRY_AFTER_SECONDS: u64 = 30;

/// Default clone-step timeout in milliseconds.
pub const DEFAULT_CLONE_TIMEOUT_MS: u64 = 120_000;

/// Default scanner-step timeout in milliseconds.
pub const DEFAULT_SCAN_TIMEOUT_MS: u64 = 300_000;

/// Default vulnerability batch size for `vulns` IPC messages.
pub const DEFAULT_VULN_BATCH_SIZE: usize = 50;

/// Default cap on captured subprocess output (10 MiB).
pub const DEFAULT_EXEC_MAX_BUFFER: usize = 10 * 1024 * 1024;

/// Default worker heap cap (150 MiB), strictly below the service memory
/// ceiling so the worker hits a recoverable allocation failure before the
/// OS kills it.
pub const DEFAULT_WORKER_HEAP_LIMIT_BYTES: u64 = 150 * 1024 * 1024;

/// Daemon configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane socket path (`SOCKET_PATH`).
    pub socket_path: PathBuf,

    /// Cap on queued jobs (`QUEUE_MAX_SIZE`).
    pub queue_max_size: usize,

    /// Cap on concurrent workers (`QUEUE_MAX_CONCURRENT`).
    pub queue_max_concurrent: usize,

    /// Cap on registry entries.
    pub registry_max_entries: usize,

    /// Per-scan vulnerability cap.
    pub registry_max_vulns_per_scan: usize,

    /// Whole-job worker timeout.
    pub worker_timeout: Duration,

    /// Grace period for cooperative worker shutdown.
    pub worker_shutdown_grace: Duration,

    /// Retry-after hint for queue-full rejections, in seconds.
    pub retry_after_seconds: u64,

    /// Clone-step timeout.
    pub clone_timeout: Duration,

    /// Scanner-step timeout.
    pub scan_timeout: Duration,

    /// Vulnerability batch size for IPC messages.
    pub vuln_batch_size: usize,

    /// Cap on captured subprocess output.
    pub exec_max_buffer: usize,

    /// Worker heap cap in bytes.
    pub worker_heap_limit_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            queue_max_size: DEFAULT_QUEUE_MAX_SIZE,
            queue_max_concurrent: DEFAULT_QUEUE_MAX_CONCURRENT,
            registry_max_entries: DEFAULT_REGISTRY_MAX_ENTRIES,
            registry_max_vulns_per_scan: DEFAULT_REGISTRY_MAX_VULNS_PER_SCAN,
            worker_timeout: Duration::from_millis(DEFAULT_WORKER_TIMEOUT_MS),
            worker_shutdown_grace: Duration::from_millis(DEFAULT_WORKER_SHUTDOWN_GRACE_MS),
            retry_after_seconds: DEFAULT_RETRY_AFTER_SECONDS,
            clone_timeout: Duration::from_millis(DEFAULT_CLONE_TIMEOUT_MS),
            scan_timeout: Duration::from_millis(DEFAULT_SCAN_TIMEOUT_MS),
            vuln_batch_size: DEFAULT_VULN_BATCH_SIZE,
            exec_max_buffer: DEFAULT_EXEC_MAX_BUFFER,
            worker_heap_limit_bytes: DEFAULT_WORKER_HEAP_LIMIT_BYTES,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an injected lookup, so tests never touch
    /// the real environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let config = Self {
            socket_path: lookup("SOCKET_PATH")
                .map_or(defaults.socket_path, PathBuf::from),
            queue_max_size: parse_or(&lookup, "QUEUE_MAX_SIZE", defaults.queue_max_size),
            queue_max_concurrent: parse_or(
                &lookup,
                "QUEUE_MAX_CONCURRENT",
                defaults.queue_max_concurrent,
            ),
            registry_max_entries: defaults.registry_max_entries,
            registry_max_vulns_per_scan: defaults.registry_max_vulns_per_scan,
            worker_timeout: defaults.worker_timeout,
            worker_shutdown_grace: defaults.worker_shutdown_grace,
            retry_after_seconds: defaults.retry_after_seconds,
            clone_timeout: defaults.clone_timeout,
            scan_timeout: defaults.scan_timeout,
            vuln_batch_size: defaults.vuln_batch_size,
            exec_max_buffer: defaults.exec_max_buffer,
            worker_heap_limit_bytes: defaults.worker_heap_limit_bytes,
        };
        config.validate();
        config
    }

    /// Sanity-check cross-knob constraints.
    ///
    /// The whole-job worker timeout must exceed clone + scan timeouts plus
    /// a margin for parsing, otherwise the manager's timer fires before the
    /// engine has had its full per-step budgets.
    #[allow(clippy::cast_possible_truncation)] // timeouts are far below u64 millis
    fn validate(&self) {
        let steps = self.clone_timeout + self.scan_timeout;
        if self.worker_timeout <= steps {
            warn!(
                worker_timeout_ms = self.worker_timeout.as_millis() as u64,
                step_budget_ms = steps.as_millis() as u64,
                "worker timeout does not exceed clone + scan budgets; jobs may time out early"
            );
        }
    }
}

/// Parse an environment value, falling back to the default (with a warning)
/// when missing is fine but unparsable is suspicious.
fn parse_or<T>(lookup: impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, fallback = %default, "unparsable value; using default");
            default
        }),
    }
}
