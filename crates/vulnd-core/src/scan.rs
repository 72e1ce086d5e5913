//! Scan data model.
//!
//! Types shared by the registry, the job queue, the IPC protocol and the
//! engine: scan identifiers, statuses, classified errors, vulnerabilities
//! and the scan record itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a scan.
///
/// A random 128-bit value rendered as text, unique per process lifetime.
/// Used as the registry key and echoed verbatim across IPC and the control
/// plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanId(String);

impl ScanId {
    /// Create a new random scan ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// View the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ScanId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ScanId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scan lifecycle state machine.
///
/// Legal transitions: `Queued -> Scanning -> Finished`,
/// `Queued -> Scanning -> Failed`, `Queued -> Failed` and
/// `Scanning -> Failed`. `Finished` and `Failed` are terminal; the registry
/// never moves a record out of a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    /// Admitted but not yet dispatched to a worker.
    Queued,

    /// A worker is running the pipeline for this scan.
    Scanning,

    /// The pipeline completed; results are final.
    Finished,

    /// The scan failed; `ScanRecord::error` carries the classification.
    Failed,
}

impl ScanStatus {
    /// Returns `true` for the terminal states `Finished` and `Failed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Scanning => write!(f, "scanning"),
            Self::Finished => write!(f, "finished"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Classified scan failure cause.
///
/// Serialized in the vendor-facing SCREAMING_SNAKE form (`TRIVY_FAILED`,
/// `CLONE_FAILED`, ...) so clients see stable codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanErrorCode {
    /// The scanner binary failed or was not found.
    TrivyFailed,

    /// Cloning the repository failed.
    CloneFailed,

    /// The worker ran out of disk while cloning or scanning.
    DiskFull,

    /// The scanner report could not be read or parsed.
    ParseFailed,

    /// A per-operation or whole-job wall-clock timeout expired.
    Timeout,

    /// The worker exhausted its memory budget (or the OS killed it).
    Oom,

    /// Anything that could not be classified.
    Unknown,
}

impl std::fmt::Display for ScanErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrivyFailed => "TRIVY_FAILED",
            Self::CloneFailed => "CLONE_FAILED",
            Self::DiskFull => "DISK_FULL",
            Self::ParseFailed => "PARSE_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Oom => "OOM",
            Self::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// A classified error carried on a failed scan record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanError {
    /// Stable failure classification.
    pub code: ScanErrorCode,

    /// Human-readable description.
    pub message: String,
}

impl ScanError {
    /// Create a new scan error.
    #[must_use]
    pub fn new(code: ScanErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Admission failure: the job queue refused the scan.
    #[must_use]
    pub fn queue_full() -> Self {
        Self::new(ScanErrorCode::Unknown, "Queue is full")
    }

    /// The whole-job wall-clock timer expired.
    #[must_use]
    pub fn worker_timeout(timeout_ms: u128) -> Self {
        Self::new(
            ScanErrorCode::Timeout,
            format!("Worker timed out after {timeout_ms} ms"),
        )
    }

    /// The worker hit its own heap limit (allocator-failure fingerprint on
    /// stderr).
    #[must_use]
    pub fn worker_oom_heap() -> Self {
        Self::new(
            ScanErrorCode::Oom,
            "Worker ran out of memory (heap limit exceeded)",
        )
    }

    /// The worker was SIGKILLed without an allocator fingerprint and not by
    /// our own timer.
    #[must_use]
    pub fn worker_oom_killed() -> Self {
        Self::new(
            ScanErrorCode::Oom,
            "Worker was killed by the OS (likely container OOM killer)",
        )
    }

    /// The worker died without reporting an outcome.
    #[must_use]
    pub fn worker_exit(code: Option<i32>, signal: Option<i32>) -> Self {
        let code = code.map_or_else(|| "none".to_string(), |c| c.to_string());
        let signal = signal.map_or_else(|| "none".to_string(), |s| s.to_string());
        Self::new(
            ScanErrorCode::Unknown,
            format!("Worker exited unexpectedly (code={code}, signal={signal})"),
        )
    }

    /// Spawn failure or channel error before the worker reported anything.
    #[must_use]
    pub fn worker_process(detail: impl std::fmt::Display) -> Self {
        Self::new(
            ScanErrorCode::Unknown,
            format!("Worker process error: {detail}"),
        )
    }
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// A single CRITICAL vulnerability, already filtered and mapped from the
/// vendor report.
///
/// Field names follow the wire contract of the original service, hence the
/// camelCase rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    /// Vendor vulnerability identifier (e.g. a CVE).
    pub id: String,

    /// Affected package name.
    pub package: String,

    /// Version found installed in the repository.
    pub installed_version: String,

    /// First fixed version, when the vendor knows one.
    #[serde(default)]
    pub fixed_version: Option<String>,

    /// Upstream severity; always `"CRITICAL"` in this system.
    pub severity: String,

    /// Short vendor title.
    pub title: String,

    /// Vendor description.
    pub description: String,
}

/// One scan's full state, owned by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRecord {
    /// Registry key, echoed across IPC and the control plane.
    pub scan_id: ScanId,

    /// Repository the scan targets.
    pub repo_url: String,

    /// Current lifecycle state.
    pub status: ScanStatus,

    /// Captured CRITICAL vulnerabilities, capped per scan.
    pub vulnerabilities: Vec<Vulnerability>,

    /// `true` iff at least one incoming vulnerability was discarded by the
    /// per-scan cap.
    pub truncated: bool,

    /// Failure classification; present only after the first failure report.
    pub error: Option<ScanError>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Last mutation time. Bumped on every mutation; never precedes
    /// `created_at`.
    pub updated_at: DateTime<Utc>,
}

impl ScanRecord {
    /// Create a fresh `Queued` record.
    #[must_use]
    pub fn new(scan_id: ScanId, repo_url: String) -> Self {
        let now = Utc::now();
        Self {
            scan_id,
            repo_url,
            status: ScanStatus::Queued,
            vulnerabilities: Vec::new(),
            truncated: false,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A unit of queued work: one scan against one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    /// The registry record this job feeds.
    pub scan_id: ScanId,

    /// Repository to clone and scan.
    pub repo_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_id_is_unique_and_textual() {
        let a = ScanId::new();
        let b = ScanId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn status_terminal_predicate() {
        assert!(!ScanStatus::Queued.is_terminal());
        assert!(!ScanStatus::Scanning.is_terminal());
        assert!(ScanStatus::Finished.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
    }

    #[test]
    fn error_code_wire_form_is_screaming_snake() {
        let json = serde_json::to_string(&ScanErrorCode::TrivyFailed).unwrap();
        assert_eq!(json, "\"TRIVY_FAILED\"");
        let json = serde_json::to_string(&ScanErrorCode::DiskFull).unwrap();
        assert_eq!(json, "\"DISK_FULL\"");
        let back: ScanErrorCode = serde_json::from_str("\"OOM\"").unwrap();
        assert_eq!(back, ScanErrorCode::Oom);
    }

    #[test]
    fn vulnerability_wire_form_is_camel_case() {
        let vuln = Vulnerability {
            id: "CVE-2021-44228".to_string(),
            package: "log4j-core".to_string(),
            installed_version: "2.14.1".to_string(),
            fixed_version: Some("2.17.0".to_string()),
            severity: "CRITICAL".to_string(),
            title: "Log4Shell".to_string(),
            description: "Remote code execution".to_string(),
        };

        let json = serde_json::to_value(&vuln).unwrap();
        assert_eq!(json["installedVersion"], "2.14.1");
        assert_eq!(json["fixedVersion"], "2.17.0");

        // fixedVersion may be absent upstream.
        let parsed: Vulnerability = serde_json::from_str(
            r#"{"id":"CVE-1","package":"p","installedVersion":"1.0",
                "severity":"CRITICAL","title":"t","description":"d"}"#,
        )
        .unwrap();
        assert_eq!(parsed.fixed_version, None);
    }

    #[test]
    fn new_record_starts_queued_and_consistent() {
        let record = ScanRecord::new(ScanId::new(), "https://github.com/o/r".to_string());
        assert_eq!(record.status, ScanStatus::Queued);
        assert!(record.vulnerabilities.is_empty());
        assert!(!record.truncated);
        assert!(record.error.is_none());
        assert_eq!(record.created_at, record.updated_at);
    }
}
