//! Property-based tests for queue admission and concurrency bounds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use proptest::prelude::*;

use super::{JobQueue, Processor, ProcessorError, QueueConfig};
use crate::scan::{ScanId, ScanJob};

#[derive(Debug, Clone)]
enum Op {
    Enqueue,
    Complete,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Enqueue),
        2 => Just(Op::Complete),
    ]
}

fn job(n: usize) -> ScanJob {
    ScanJob {
        scan_id: ScanId::from(format!("scan-{n}")),
        repo_url: "https://github.com/owner/repo".to_string(),
    }
}

proptest! {
    /// Under any interleaving of enqueues and completions the gate bounds
    /// hold: `0 <= active <= max_concurrent` and `pending <= max_queued`.
    #[test]
    fn prop_gate_bounds_hold(
        ops in proptest::collection::vec(op_strategy(), 0..200),
        max_queued in 0usize..8,
        max_concurrent in 0usize..4,
    ) {
        let mut queue = JobQueue::new(QueueConfig { max_queued, max_concurrent });
        let dispatched = Arc::new(AtomicUsize::new(0));
        let dispatched_clone = Arc::clone(&dispatched);
        let processor: Processor = Arc::new(move |_job| {
            dispatched_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.set_processor(processor);

        for (n, op) in ops.into_iter().enumerate() {
            match op {
                Op::Enqueue => {
                    let was_full = queue.is_full();
                    let accepted = queue.enqueue(job(n));
                    // Rejection happens exactly at the pending cap.
                    prop_assert_eq!(accepted, !was_full);
                },
                Op::Complete => queue.on_job_complete(),
            }

            prop_assert!(queue.active() <= max_concurrent);
            prop_assert!(queue.pending() <= max_queued);
        }
    }

    /// Every admitted job is eventually dispatched exactly once when
    /// completions keep arriving: dispatched == admitted after the queue
    /// fully drains.
    #[test]
    fn prop_admitted_jobs_dispatch_exactly_once(
        jobs in 0usize..40,
        max_queued in 1usize..8,
        max_concurrent in 1usize..4,
    ) {
        let mut queue = JobQueue::new(QueueConfig { max_queued, max_concurrent });
        let dispatched = Arc::new(AtomicUsize::new(0));
        let dispatched_clone = Arc::clone(&dispatched);
        let processor: Processor = Arc::new(move |_job| {
            dispatched_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        queue.set_processor(processor);

        let mut admitted = 0usize;
        for n in 0..jobs {
            if queue.enqueue(job(n)) {
                admitted += 1;
            }
            // Model the deterministic settle: every dispatched job
            // completes promptly, freeing the slot for the next.
            while queue.active() > 0 {
                queue.on_job_complete();
            }
        }

        prop_assert_eq!(dispatched.load(Ordering::SeqCst), admitted);
        prop_assert_eq!(queue.pending(), 0);
        prop_assert_eq!(queue.active(), 0);
    }

    /// A synchronously failing processor never leaks a slot: after the
    /// queue settles, active returns to zero.
    #[test]
    fn prop_failing_processor_leaks_no_slots(
        jobs in 0usize..40,
        fail_every in 1usize..5,
        max_concurrent in 1usize..4,
    ) {
        let mut queue = JobQueue::new(QueueConfig { max_queued: 8, max_concurrent });
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let processor: Processor = Arc::new(move |_job| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n % fail_every == 0 {
                Err(ProcessorError("synthetic".to_string()))
            } else {
                Ok(())
            }
        });
        queue.set_processor(processor);

        for n in 0..jobs {
            let _ = queue.enqueue(job(n));
            while queue.active() > 0 {
                queue.on_job_complete();
            }
        }

        prop_assert_eq!(queue.active(), 0);
        prop_assert_eq!(queue.pending(), 0);
    }
}
