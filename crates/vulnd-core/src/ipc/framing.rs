//! Length-prefixed frame codec for the worker channel.
//!
//! Each frame is a 4-byte big-endian length followed by the payload:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! The length is validated against [`MAX_FRAME_SIZE`] *before* any
//! allocation, so a corrupt or hostile peer cannot make the reader balloon.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::IpcError;

/// Length of the frame header (4 bytes for a u32 length prefix).
const HEADER_LEN: usize = 4;

/// Maximum frame payload size (1 MiB).
///
/// A vulnerability batch is capped at 50 records, so real frames sit far
/// below this; the cap exists to bound reads, not to shape traffic.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame codec for use with [`tokio_util::codec::Framed`] on the worker
/// channel and the control-plane socket.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    _private: (),
}

impl FrameCodec {
    /// Create a new frame codec.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, IpcError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before allocating.
        if length > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            // Reserve what the rest of the frame needs to reduce
            // reallocations while it trickles in.
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), IpcError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(IpcError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}
