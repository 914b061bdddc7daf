//! Streaming frame accumulator for byte streams.
//!
//! Wraps the pure codec in `coapstream-core` with the carry-over buffer a
//! session needs: bytes arrive in arbitrary chunks, complete frames come out
//! in wire order, partial frames persist until the next read.

use coapstream_core::frame::{Extract, Frame, FrameHeader, try_extract_frame};

use crate::error::TransportError;

/// Default ceiling on a single frame's declared total size.
///
/// Well above the 1152-byte default message size so peers that negotiated
/// larger transfers still fit, small enough that garbage parsed as a
/// 4-byte-extension length fails fast instead of stalling the session.
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Stateful accumulator that buffers stream data and extracts complete
/// length-prefixed frames.
///
/// The buffer is owned exclusively by the session feeding it; it carries
/// partial frames across reads and across any number of `feed` calls.
pub struct FrameAccumulator {
    buffer: Vec<u8>,
    max_frame_len: usize,
}

impl FrameAccumulator {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_LEN)
    }

    /// An accumulator that rejects frames whose declared total exceeds `max_frame_len`.
    pub fn with_limit(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            max_frame_len,
        }
    }

    /// Feed new stream data and extract all complete frames.
    ///
    /// Returns frames in wire order. A declared frame size above the limit is
    /// an error; the caller is expected to close the connection, since there
    /// is no way to resynchronize a corrupt length prefix. Short buffers are
    /// never an error, just an empty result.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, TransportError> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            if let Some(header) = FrameHeader::parse(&self.buffer) {
                let declared = header.total_len();
                if declared > self.max_frame_len as u64 {
                    return Err(TransportError::OversizedFrame {
                        declared,
                        limit: self.max_frame_len,
                    });
                }
            }
            match try_extract_frame(&self.buffer) {
                Extract::Frame(frame) => {
                    self.buffer.drain(..frame.consumed());
                    frames.push(frame);
                }
                Extract::NeedMoreData => break,
            }
        }
        Ok(frames)
    }

    /// Number of carried-over bytes awaiting the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
