//! Bounded FIFO job queue.
//!
//! Admission control plus a concurrency gate over a single injected
//! processor. The queue never awaits the processor: dispatch is
//! fire-and-forget, and every dispatched job must be released by exactly
//! one later [`JobQueue::on_job_complete`] call.
//!
//! Like the registry, the queue is plain state serialized behind one mutex
//! by the daemon; all operations here are short and non-blocking.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config;
use crate::scan::ScanJob;

/// Error returned by a processor that failed synchronously, before any
/// asynchronous work (and therefore any later completion call) could start.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ProcessorError(pub String);

/// The injected job processor.
///
/// Must be fire-and-forget: kick off the work and return. A synchronous
/// `Err` tells the queue that the job never started, so the queue reclaims
/// the concurrency slot itself; the processor is responsible for surfacing
/// the failure on the scan record before returning it.
pub type Processor = Arc<dyn Fn(ScanJob) -> Result<(), ProcessorError> + Send + Sync>;

/// Queue capacity configuration.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Cap on jobs waiting for dispatch; `enqueue` rejects beyond this.
    pub max_queued: usize,

    /// Cap on concurrently dispatched jobs.
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queued: config::DEFAULT_QUEUE_MAX_SIZE,
            max_concurrent: config::DEFAULT_QUEUE_MAX_CONCURRENT,
        }
    }
}

/// Bounded FIFO queue with a concurrency gate.
pub struct JobQueue {
    config: QueueConfig,
    pending: VecDeque<ScanJob>,
    active_count: usize,
    processor: Option<Processor>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("config", &self.config)
            .field("pending", &self.pending.len())
            .field("active_count", &self.active_count)
            .field("processor", &self.processor.is_some())
            .finish()
    }
}

impl JobQueue {
    /// Create an empty queue with no processor installed.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            pending: VecDeque::new(),
            active_count: 0,
            processor: None,
        }
    }

    /// Install the processor and immediately drain as much as capacity
    /// allows.
    pub fn set_processor(&mut self, processor: Processor) {
        self.processor = Some(processor);
        self.drain();
    }

    /// Admit a job.
    ///
    /// Returns `false` (admission rejected) when the pending backlog is at
    /// capacity; otherwise appends, drains, and returns `true`.
    pub fn enqueue(&mut self, job: ScanJob) -> bool {
        if self.pending.len() >= self.config.max_queued {
            debug!(
                scan_id = %job.scan_id,
                max_queued = self.config.max_queued,
                "queue full; rejecting job"
            );
            return false;
        }

        self.pending.push_back(job);
        self.drain();
        true
    }

    /// Release one concurrency slot and drain.
    ///
    /// Called exactly once per dispatched job, by whoever settled it.
    /// Floored at zero so a stray call can never poison the gate.
    pub fn on_job_complete(&mut self) {
        if self.active_count == 0 {
            warn!("on_job_complete with no active jobs");
        }
        self.active_count = self.active_count.saturating_sub(1);
        self.drain();
    }

    /// Number of jobs waiting for dispatch.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of dispatched, not-yet-completed jobs.
    #[must_use]
    pub const fn active(&self) -> usize {
        self.active_count
    }

    /// Returns `true` when the next `enqueue` would be rejected.
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.config.max_queued
    }

    /// Dispatch pending jobs in FIFO order while capacity allows.
    ///
    /// The processor call is fire-and-forget. If it fails synchronously the
    /// job never started, so no completion call will ever arrive for it and
    /// the slot is reclaimed here.
    fn drain(&mut self) {
        let Some(processor) = self.processor.clone() else {
            return;
        };

        while self.active_count < self.config.max_concurrent {
            let Some(job) = self.pending.pop_front() else {
                break;
            };

            self.active_count += 1;
            if let Err(error) = processor(job.clone()) {
                warn!(
                    scan_id = %job.scan_id,
                    %error,
                    "processor failed synchronously; reclaiming slot"
                );
                self.active_count = self.active_count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod proptests;
