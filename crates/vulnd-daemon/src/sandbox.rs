//! Child-process sandboxing helpers.
//!
//! The parent environment is untrusted context for children: both the
//! worker spawn (manager side) and the git/trivy invocations (engine side)
//! start from `env_clear()` and re-export an allowlist, never a denylist.

use std::os::fd::RawFd;

use tokio::process::Command;

/// File descriptor the worker channel is installed on in the child.
///
/// Chosen so stdout stays free (ignored by the manager) and stderr stays
/// free for the OOM fingerprint capture.
pub const WORKER_CHANNEL_FD: RawFd = 3;

/// Environment variables forwarded into child processes.
///
/// `PATH`/`HOME`/`TMPDIR` for basic operation, `RUST_LOG` so worker logs
/// follow the daemon's filter, and the proxy/CA-bundle family so clones
/// work behind corporate egress. Everything else - above all secrets - is
/// dropped.
pub const ENV_ALLOWLIST: [&str; 12] = [
    "PATH",
    "HOME",
    "TMPDIR",
    "RUST_LOG",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NO_PROXY",
    "http_proxy",
    "https_proxy",
    "no_proxy",
    "SSL_CERT_FILE",
    "SSL_CERT_DIR",
];

/// Replace a command's environment with the sanitized allowlist.
pub fn sanitize_env(cmd: &mut Command) {
    cmd.env_clear();
    for name in ENV_ALLOWLIST {
        if let Ok(value) = std::env::var(name) {
            cmd.env(name, value);
        }
    }
}
