//! Property-based tests for registry bounds and terminal-state stickiness.

use proptest::prelude::*;

use super::{RegistryConfig, ScanRegistry};
use crate::scan::{ScanError, ScanErrorCode, ScanId, ScanStatus, Vulnerability};

/// A registry operation applied against a small fixed pool of scan IDs.
#[derive(Debug, Clone)]
enum Op {
    Create(u8),
    UpdateStatus(u8, ScanStatus),
    Append(u8, usize),
    SetError(u8),
}

fn scan_id(slot: u8) -> ScanId {
    ScanId::from(format!("scan-{slot}"))
}

fn vulns(count: usize) -> Vec<Vulnerability> {
    (0..count)
        .map(|i| Vulnerability {
            id: format!("CVE-{i}"),
            package: "pkg".to_string(),
            installed_version: "1.0.0".to_string(),
            fixed_version: None,
            severity: "CRITICAL".to_string(),
            title: String::new(),
            description: String::new(),
        })
        .collect()
}

fn status_strategy() -> impl Strategy<Value = ScanStatus> {
    prop_oneof![
        Just(ScanStatus::Queued),
        Just(ScanStatus::Scanning),
        Just(ScanStatus::Finished),
        Just(ScanStatus::Failed),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..16).prop_map(Op::Create),
        (0u8..16, status_strategy()).prop_map(|(slot, status)| Op::UpdateStatus(slot, status)),
        (0u8..16, 0usize..12).prop_map(|(slot, count)| Op::Append(slot, count)),
        (0u8..16).prop_map(Op::SetError),
    ]
}

proptest! {
    /// After any operation sequence, both capacity bounds hold and no
    /// record exceeds the per-scan vulnerability cap.
    #[test]
    fn prop_capacity_bounds_hold(
        ops in proptest::collection::vec(op_strategy(), 0..200),
        max_entries in 1usize..8,
        max_vulns in 1usize..8,
    ) {
        let mut reg = ScanRegistry::new(RegistryConfig { max_entries, max_vulns_per_scan: max_vulns });

        for op in ops {
            match op {
                Op::Create(slot) => { let _ = reg.create(scan_id(slot), "u".to_string()); },
                Op::UpdateStatus(slot, status) => reg.update_status(&scan_id(slot), status),
                Op::Append(slot, count) => reg.append_vulnerabilities(&scan_id(slot), vulns(count)),
                Op::SetError(slot) => reg.set_error(
                    &scan_id(slot),
                    ScanError::new(ScanErrorCode::Unknown, "prop"),
                ),
            }

            prop_assert!(reg.len() <= max_entries);
            for slot in 0..16u8 {
                if let Some(record) = reg.get(&scan_id(slot)) {
                    prop_assert!(record.vulnerabilities.len() <= max_vulns);
                    prop_assert!(record.created_at <= record.updated_at);
                }
            }
        }
    }

    /// Once at least one vulnerability was discarded, `truncated` stays
    /// true for the life of the record.
    #[test]
    fn prop_truncated_is_permanent(
        batches in proptest::collection::vec(0usize..10, 1..30),
        max_vulns in 1usize..8,
    ) {
        let mut reg = ScanRegistry::new(RegistryConfig { max_entries: 4, max_vulns_per_scan: max_vulns });
        let id = scan_id(0);
        reg.create(id.clone(), "u".to_string()).unwrap();

        let mut sent = 0usize;
        let mut discarded_ever = false;
        for count in batches {
            sent += count;
            reg.append_vulnerabilities(&id, vulns(count));
            let record = reg.get(&id).unwrap();
            discarded_ever = discarded_ever || sent > max_vulns;
            prop_assert_eq!(record.truncated, discarded_ever);
            prop_assert_eq!(record.vulnerabilities.len(), sent.min(max_vulns));
        }
    }

    /// No transition out of a terminal state is ever observable, under any
    /// interleaving of status updates and error reports.
    #[test]
    fn prop_terminal_states_are_sticky(
        ops in proptest::collection::vec(op_strategy(), 0..200),
    ) {
        let mut reg = ScanRegistry::new(RegistryConfig { max_entries: 8, max_vulns_per_scan: 8 });
        let mut terminal_seen: std::collections::HashMap<u8, ScanStatus> =
            std::collections::HashMap::new();

        for op in ops {
            let touched = match op {
                Op::Create(slot) => {
                    if reg.create(scan_id(slot), "u".to_string()).is_ok() {
                        terminal_seen.remove(&slot);
                    }
                    slot
                },
                Op::UpdateStatus(slot, status) => {
                    reg.update_status(&scan_id(slot), status);
                    slot
                },
                Op::Append(slot, count) => {
                    reg.append_vulnerabilities(&scan_id(slot), vulns(count));
                    slot
                },
                Op::SetError(slot) => {
                    reg.set_error(&scan_id(slot), ScanError::new(ScanErrorCode::Unknown, "prop"));
                    slot
                },
            };

            if let Some(record) = reg.get(&scan_id(touched)) {
                if let Some(&frozen) = terminal_seen.get(&touched) {
                    prop_assert_eq!(record.status, frozen);
                } else if record.status.is_terminal() {
                    terminal_seen.insert(touched, record.status);
                }
            }
        }
    }

    /// Eviction never removes an in-flight record while a terminal record
    /// exists.
    #[test]
    fn prop_eviction_prefers_terminal(
        finish_mask in proptest::collection::vec(any::<bool>(), 8),
    ) {
        let max_entries = 4usize;
        let mut reg = ScanRegistry::new(RegistryConfig { max_entries, max_vulns_per_scan: 8 });

        // Fill to capacity with a mix of in-flight and terminal records.
        for (i, &finish) in finish_mask.iter().take(max_entries).enumerate() {
            let id = scan_id(u8::try_from(i).unwrap());
            reg.create(id.clone(), "u".to_string()).unwrap();
            reg.update_status(&id, ScanStatus::Scanning);
            if finish {
                reg.update_status(&id, ScanStatus::Finished);
            }
        }

        let had_terminal = finish_mask.iter().take(max_entries).any(|&f| f);
        reg.create(scan_id(15), "u".to_string()).unwrap();

        if had_terminal {
            // Every surviving pre-existing record that was in-flight must
            // still be present: only terminal victims were taken.
            for (i, &finish) in finish_mask.iter().take(max_entries).enumerate() {
                if !finish {
                    let id = scan_id(u8::try_from(i).unwrap());
                    prop_assert!(reg.get(&id).is_some());
                }
            }
        }
        prop_assert!(reg.len() <= max_entries);
    }
}
