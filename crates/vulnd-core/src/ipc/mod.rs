//! Orchestrator/worker IPC protocol.
//!
//! A tagged message schema carried as length-prefixed JSON frames over the
//! socketpair between the daemon and an engine worker. The orchestrator
//! sends exactly one [`WorkerRequest::Start`] per child; the worker streams
//! [`WorkerEvent`]s back until it reports a terminal outcome and exits.
//!
//! Both ends decode through the total decoders below: malformed frames are
//! errors, unknown tags are ignored (`Ok(None)`), and a message whose scan
//! ID does not match the current job is dropped by the consumer.

mod framing;

pub use framing::{FrameCodec, MAX_FRAME_SIZE};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::scan::{ScanError, ScanId, ScanStatus, Vulnerability};

/// IPC errors.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Frame payload is not valid JSON or does not match the tagged shape.
    #[error("malformed IPC message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Frame payload carries no `type` tag.
    #[error("IPC message has no type tag")]
    MissingTag,

    /// A `status` event carried a status the worker may not report.
    #[error("worker may not report status '{0}'")]
    InvalidStatus(ScanStatus),

    /// Incoming frame length exceeds the protocol cap.
    #[error("frame of {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Declared frame length.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// Underlying channel I/O failure.
    #[error("IPC channel error: {0}")]
    Io(#[from] std::io::Error),
}

/// Messages from the orchestrator to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Start the pipeline for one scan. Sent exactly once per child,
    /// immediately after the channel opens.
    Start {
        /// Registry key for this scan.
        scan_id: ScanId,
        /// Repository to clone and scan.
        repo_url: String,
    },
}

/// Messages from a worker to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    /// Coarse status transition. Workers only report `Scanning` and
    /// `Finished`; everything else is the orchestrator's business.
    Status {
        /// Scan this event belongs to.
        scan_id: ScanId,
        /// The new status.
        status: ScanStatus,
    },

    /// A batch of already-filtered CRITICAL vulnerabilities. Zero or more
    /// per scan, each capped by the engine's batch size.
    Vulns {
        /// Scan this event belongs to.
        scan_id: ScanId,
        /// The batch, in report order.
        vulnerabilities: Vec<Vulnerability>,
    },

    /// Classified failure. At most one per child; the child exits right
    /// after sending it.
    Error {
        /// Scan this event belongs to.
        scan_id: ScanId,
        /// The classified failure.
        error: ScanError,
    },
}

impl WorkerEvent {
    /// The scan ID this event is keyed on.
    #[must_use]
    pub const fn scan_id(&self) -> &ScanId {
        match self {
            Self::Status { scan_id, .. }
            | Self::Vulns { scan_id, .. }
            | Self::Error { scan_id, .. } => scan_id,
        }
    }
}

/// Tags this protocol understands, used to tell "unknown message" from
/// "malformed message".
const EVENT_TAGS: [&str; 3] = ["status", "vulns", "error"];
const REQUEST_TAGS: [&str; 1] = ["start"];

/// Encode a message as a frame payload.
///
/// # Errors
///
/// Returns [`IpcError::Malformed`] if the message cannot be serialized
/// (practically unreachable for these types).
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes, IpcError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

/// Total decoder for worker-to-orchestrator frames.
///
/// Returns `Ok(None)` for well-formed messages with an unknown tag; those
/// are ignored, not fatal.
///
/// # Errors
///
/// Returns [`IpcError::Malformed`] for invalid JSON or a known tag with a
/// bad payload, [`IpcError::MissingTag`] when the tag is absent, and
/// [`IpcError::InvalidStatus`] when a `status` event carries a status
/// workers may not report.
pub fn decode_event(frame: &[u8]) -> Result<Option<WorkerEvent>, IpcError> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    let Some(tag) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(IpcError::MissingTag);
    };

    if !EVENT_TAGS.contains(&tag) {
        return Ok(None);
    }

    let event: WorkerEvent = serde_json::from_value(value)?;
    if let WorkerEvent::Status { status, .. } = &event {
        if !matches!(status, ScanStatus::Scanning | ScanStatus::Finished) {
            return Err(IpcError::InvalidStatus(*status));
        }
    }
    Ok(Some(event))
}

/// Total decoder for orchestrator-to-worker frames; same tag policy as
/// [`decode_event`].
///
/// # Errors
///
/// Returns [`IpcError::Malformed`] for invalid JSON or a bad `start`
/// payload, and [`IpcError::MissingTag`] when the tag is absent.
pub fn decode_request(frame: &[u8]) -> Result<Option<WorkerRequest>, IpcError> {
    let value: serde_json::Value = serde_json::from_slice(frame)?;
    let Some(tag) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(IpcError::MissingTag);
    };

    if !REQUEST_TAGS.contains(&tag) {
        return Ok(None);
    }

    Ok(Some(serde_json::from_value(value)?))
}
