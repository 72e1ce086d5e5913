//! Bounded scan registry.
//!
//! Process-local, insertion-ordered store of scan records. Enforces a
//! per-scan vulnerability cap and a global entry cap with status-aware
//! eviction: terminal records are always preferred as victims over records
//! whose workers are still running.
//!
//! The registry is plain state; the daemon serializes access behind a single
//! mutex held for the duration of each (short, non-blocking) operation.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config;
use crate::scan::{ScanError, ScanId, ScanRecord, ScanStatus, Vulnerability};

/// Registry capacity configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    /// Global cap on stored records; eviction keeps the store below this.
    pub max_entries: usize,

    /// Per-scan cap on captured vulnerabilities.
    pub max_vulns_per_scan: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_entries: config::DEFAULT_REGISTRY_MAX_ENTRIES,
            max_vulns_per_scan: config::DEFAULT_REGISTRY_MAX_VULNS_PER_SCAN,
        }
    }
}

/// Registry errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A record with this scan ID already exists. The registry never
    /// silently overwrites.
    #[error("scan '{0}' already exists")]
    DuplicateScanId(ScanId),
}

/// Insertion-ordered mapping from scan ID to scan record.
///
/// Insertion order doubles as the LRU proxy for eviction; the registry does
/// not track last-access time.
#[derive(Debug)]
pub struct ScanRegistry {
    config: RegistryConfig,

    /// Records by scan ID.
    records: HashMap<ScanId, ScanRecord>,

    /// Scan IDs in insertion order. Kept in lockstep with `records`.
    order: VecDeque<ScanId>,
}

impl ScanRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            records: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Insert a fresh `Queued` record, evicting first if the store is at
    /// capacity.
    ///
    /// Returns a snapshot of the new record. External code never holds a
    /// reference into the registry beyond the current call.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::DuplicateScanId`] if a record with this ID
    /// already exists.
    pub fn create(&mut self, scan_id: ScanId, repo_url: String) -> Result<ScanRecord, RegistryError> {
        if self.records.contains_key(&scan_id) {
            return Err(RegistryError::DuplicateScanId(scan_id));
        }

        self.evict_for_insert();

        let record = ScanRecord::new(scan_id.clone(), repo_url);
        self.records.insert(scan_id.clone(), record.clone());
        self.order.push_back(scan_id);
        Ok(record)
    }

    /// Get a snapshot of a record.
    #[must_use]
    pub fn get(&self, scan_id: &ScanId) -> Option<ScanRecord> {
        self.records.get(scan_id).cloned()
    }

    /// Set a record's status and bump `updated_at`.
    ///
    /// No-op for unknown scan IDs (e.g. late IPC for an evicted scan).
    /// Refuses to transition away from a terminal state.
    pub fn update_status(&mut self, scan_id: &ScanId, status: ScanStatus) {
        let Some(record) = self.records.get_mut(scan_id) else {
            debug!(scan_id = %scan_id, "status update for unknown scan dropped");
            return;
        };

        if record.status.is_terminal() {
            debug!(
                scan_id = %scan_id,
                current = %record.status,
                requested = %status,
                "ignoring status update on terminal record"
            );
            return;
        }

        record.status = status;
        record.updated_at = Utc::now();
    }

    /// Append vulnerabilities up to the per-scan cap, preserving incoming
    /// order.
    ///
    /// Anything beyond the cap is discarded and the record's `truncated`
    /// flag is set. No-op for unknown scan IDs.
    pub fn append_vulnerabilities(&mut self, scan_id: &ScanId, vulns: Vec<Vulnerability>) {
        let Some(record) = self.records.get_mut(scan_id) else {
            debug!(scan_id = %scan_id, "vulnerability batch for unknown scan dropped");
            return;
        };

        let remaining = self
            .config
            .max_vulns_per_scan
            .saturating_sub(record.vulnerabilities.len());

        if remaining == 0 {
            if !vulns.is_empty() {
                record.truncated = true;
            }
            return;
        }

        if vulns.len() > remaining {
            record.truncated = true;
            warn!(
                scan_id = %scan_id,
                discarded = vulns.len() - remaining,
                cap = self.config.max_vulns_per_scan,
                "vulnerability cap reached; discarding overflow"
            );
        }

        let take = vulns.len().min(remaining);
        if take > 0 {
            record.vulnerabilities.extend(vulns.into_iter().take(take));
            record.updated_at = Utc::now();
        }
    }

    /// Record a classified failure: overwrites `error`, forces status to
    /// `Failed` and bumps `updated_at`.
    ///
    /// No-op for unknown scan IDs. A `Finished` record is left untouched -
    /// no transition out of a terminal state is ever observable. An
    /// already-`Failed` record accepts the overwrite (idempotent re-report).
    pub fn set_error(&mut self, scan_id: &ScanId, error: ScanError) {
        let Some(record) = self.records.get_mut(scan_id) else {
            debug!(scan_id = %scan_id, "error report for unknown scan dropped");
            return;
        };

        if record.status == ScanStatus::Finished {
            warn!(scan_id = %scan_id, error = %error, "error report for finished scan ignored");
            return;
        }

        record.error = Some(error);
        record.status = ScanStatus::Failed;
        record.updated_at = Utc::now();
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// All stored scan IDs, in insertion order.
    #[must_use]
    pub fn scan_ids(&self) -> Vec<ScanId> {
        self.order.iter().cloned().collect()
    }

    /// Returns `true` when no records are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Make room for one insertion.
    ///
    /// First pass walks insertion order and evicts terminal records until
    /// under the cap. Second pass, only if still at capacity, evicts in
    /// insertion order regardless of status; an in-flight scan evicted here
    /// keeps running and its later IPC is dropped by the keyed no-ops above.
    fn evict_for_insert(&mut self) {
        if self.records.len() < self.config.max_entries {
            return;
        }

        let mut index = 0;
        while self.records.len() >= self.config.max_entries && index < self.order.len() {
            let terminal = self
                .records
                .get(&self.order[index])
                .is_some_and(|r| r.status.is_terminal());

            if terminal {
                if let Some(id) = self.order.remove(index) {
                    debug!(scan_id = %id, "evicting terminal scan record");
                    self.records.remove(&id);
                }
            } else {
                index += 1;
            }
        }

        while self.records.len() >= self.config.max_entries {
            let Some(id) = self.order.pop_front() else {
                break;
            };
            warn!(scan_id = %id, "registry over capacity; evicting in-flight scan record");
            self.records.remove(&id);
        }
    }
}

#[cfg(test)]
mod proptests;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::ScanErrorCode;

    fn vuln(id: &str) -> Vulnerability {
        Vulnerability {
            id: id.to_string(),
            package: "pkg".to_string(),
            installed_version: "1.0.0".to_string(),
            fixed_version: None,
            severity: "CRITICAL".to_string(),
            title: String::new(),
            description: String::new(),
        }
    }

    fn registry(max_entries: usize, max_vulns: usize) -> ScanRegistry {
        ScanRegistry::new(RegistryConfig {
            max_entries,
            max_vulns_per_scan: max_vulns,
        })
    }

    #[test]
    fn create_and_get_roundtrip() {
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        reg.create(id.clone(), "https://github.com/o/r".to_string())
            .unwrap();

        let record = reg.get(&id).unwrap();
        assert_eq!(record.status, ScanStatus::Queued);
        assert_eq!(record.repo_url, "https://github.com/o/r");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn duplicate_scan_id_rejected() {
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();

        let result = reg.create(id, "u".to_string());
        assert!(matches!(result, Err(RegistryError::DuplicateScanId(_))));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn truncation_at_cap_preserves_order() {
        // Cap 3: [CVE-1, CVE-2] then [CVE-3, CVE-4, CVE-5] stores the first
        // three and flags truncation.
        let mut reg = registry(10, 3);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();

        reg.append_vulnerabilities(&id, vec![vuln("CVE-1"), vuln("CVE-2")]);
        let record = reg.get(&id).unwrap();
        assert!(!record.truncated);

        reg.append_vulnerabilities(&id, vec![vuln("CVE-3"), vuln("CVE-4"), vuln("CVE-5")]);
        let record = reg.get(&id).unwrap();
        let ids: Vec<&str> = record.vulnerabilities.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, ["CVE-1", "CVE-2", "CVE-3"]);
        assert!(record.truncated);
    }

    #[test]
    fn exactly_remaining_items_do_not_truncate() {
        let mut reg = registry(10, 3);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();

        reg.append_vulnerabilities(&id, vec![vuln("a"), vuln("b"), vuln("c")]);
        let record = reg.get(&id).unwrap();
        assert_eq!(record.vulnerabilities.len(), 3);
        assert!(!record.truncated);

        // One more over the cap flips the flag without storing anything.
        reg.append_vulnerabilities(&id, vec![vuln("d")]);
        let record = reg.get(&id).unwrap();
        assert_eq!(record.vulnerabilities.len(), 3);
        assert!(record.truncated);
    }

    #[test]
    fn terminal_status_is_sticky() {
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();

        reg.update_status(&id, ScanStatus::Scanning);
        reg.update_status(&id, ScanStatus::Finished);
        reg.update_status(&id, ScanStatus::Scanning);

        assert_eq!(reg.get(&id).unwrap().status, ScanStatus::Finished);
    }

    #[test]
    fn set_error_forces_failed_and_is_idempotent() {
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();
        reg.update_status(&id, ScanStatus::Scanning);

        let error = ScanError::new(ScanErrorCode::CloneFailed, "mock clone failure");
        reg.set_error(&id, error.clone());
        let first = reg.get(&id).unwrap();
        assert_eq!(first.status, ScanStatus::Failed);
        assert_eq!(first.error.as_ref().unwrap(), &error);

        reg.set_error(&id, error.clone());
        let second = reg.get(&id).unwrap();
        assert_eq!(second.status, first.status);
        assert_eq!(second.error, first.error);
        assert_eq!(second.vulnerabilities, first.vulnerabilities);
        assert!(second.updated_at >= first.updated_at);
    }

    #[test]
    fn set_error_never_reopens_finished() {
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();
        reg.update_status(&id, ScanStatus::Scanning);
        reg.update_status(&id, ScanStatus::Finished);

        reg.set_error(&id, ScanError::new(ScanErrorCode::Unknown, "late"));
        let record = reg.get(&id).unwrap();
        assert_eq!(record.status, ScanStatus::Finished);
        assert!(record.error.is_none());
    }

    #[test]
    fn failed_without_error_then_set_error() {
        // Failing via update_status leaves error empty until a later
        // set_error fills it in.
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        reg.create(id.clone(), "u".to_string()).unwrap();

        reg.update_status(&id, ScanStatus::Failed);
        let record = reg.get(&id).unwrap();
        assert_eq!(record.status, ScanStatus::Failed);
        assert!(record.error.is_none());

        reg.set_error(&id, ScanError::new(ScanErrorCode::Timeout, "late report"));
        let record = reg.get(&id).unwrap();
        assert_eq!(record.status, ScanStatus::Failed);
        assert_eq!(record.error.unwrap().code, ScanErrorCode::Timeout);
    }

    #[test]
    fn eviction_prefers_terminal_records() {
        // s1 scanning, s2 finished, s3 incoming: s2 is the victim.
        let mut reg = registry(2, 10);
        let s1 = ScanId::from("s1");
        let s2 = ScanId::from("s2");
        let s3 = ScanId::from("s3");

        reg.create(s1.clone(), "u1".to_string()).unwrap();
        reg.update_status(&s1, ScanStatus::Scanning);
        reg.create(s2.clone(), "u2".to_string()).unwrap();
        reg.update_status(&s2, ScanStatus::Scanning);
        reg.update_status(&s2, ScanStatus::Finished);

        reg.create(s3.clone(), "u3".to_string()).unwrap();

        assert_eq!(reg.len(), 2);
        assert!(reg.get(&s1).is_some());
        assert!(reg.get(&s2).is_none());
        assert!(reg.get(&s3).is_some());
    }

    #[test]
    fn eviction_falls_back_to_insertion_order() {
        // No terminal victims: the oldest in-flight record goes.
        let mut reg = registry(2, 10);
        let s1 = ScanId::from("s1");
        let s2 = ScanId::from("s2");
        let s3 = ScanId::from("s3");

        reg.create(s1.clone(), "u1".to_string()).unwrap();
        reg.update_status(&s1, ScanStatus::Scanning);
        reg.create(s2.clone(), "u2".to_string()).unwrap();
        reg.update_status(&s2, ScanStatus::Scanning);

        reg.create(s3.clone(), "u3".to_string()).unwrap();

        assert!(reg.get(&s1).is_none());
        assert!(reg.get(&s2).is_some());
        assert!(reg.get(&s3).is_some());
    }

    #[test]
    fn evicted_scan_ipc_is_dropped() {
        // Mutations keyed on an evicted ID are no-ops and never recreate
        // the record.
        let mut reg = registry(1, 10);
        let s1 = ScanId::from("s1");
        let s2 = ScanId::from("s2");

        reg.create(s1.clone(), "u1".to_string()).unwrap();
        reg.update_status(&s1, ScanStatus::Scanning);
        reg.create(s2.clone(), "u2".to_string()).unwrap();
        assert!(reg.get(&s1).is_none());

        reg.update_status(&s1, ScanStatus::Finished);
        reg.append_vulnerabilities(&s1, vec![vuln("CVE-1")]);
        reg.set_error(&s1, ScanError::new(ScanErrorCode::Unknown, "late"));

        assert!(reg.get(&s1).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn updated_at_moves_on_mutation() {
        let mut reg = registry(10, 10);
        let id = ScanId::new();
        let created = reg.create(id.clone(), "u".to_string()).unwrap();

        reg.update_status(&id, ScanStatus::Scanning);
        let after_status = reg.get(&id).unwrap();
        assert!(after_status.updated_at >= created.updated_at);

        reg.append_vulnerabilities(&id, vec![vuln("CVE-1")]);
        let after_append = reg.get(&id).unwrap();
        assert!(after_append.updated_at >= after_status.updated_at);
        assert!(after_append.created_at <= after_append.updated_at);
    }
}
