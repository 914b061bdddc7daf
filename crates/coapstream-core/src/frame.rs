//! Length-prefixed message framing for reliable byte streams.
//!
//! Each message starts with one byte whose high nibble is a length indicator
//! and whose low nibble is the token length. Indicators 0..=12 carry the
//! payload length directly; 13, 14, and 15 escape to 1-, 2-, and 4-byte
//! big-endian length extensions with offsets 13, 269, and 65805. The token
//! length is added on top of the indicated payload length, so the total frame
//! size is computable from the first bytes alone.

extern crate alloc;
use alloc::vec::Vec;

use crate::error::FrameError;

/// Length-nibble value introducing a 1-byte length extension.
pub const LEN_EXT8: u8 = 13;
/// Length-nibble value introducing a 2-byte length extension.
pub const LEN_EXT16: u8 = 14;
/// Length-nibble value introducing a 4-byte length extension.
pub const LEN_EXT32: u8 = 15;

/// Payload length offset of the 1-byte extension branch.
pub const EXT8_OFFSET: u64 = 13;
/// Payload length offset of the 2-byte extension branch.
pub const EXT16_OFFSET: u64 = 269;
/// Payload length offset of the 4-byte extension branch.
pub const EXT32_OFFSET: u64 = 65805;

/// Maximum token length encodable in the low nibble.
pub const MAX_TOKEN_LEN: usize = 15;

/// Largest payload length representable by the 4-byte extension branch.
pub const MAX_PAYLOAD_LEN: u64 = u32::MAX as u64 + EXT32_OFFSET;

/// Parsed geometry of a frame header.
///
/// `header_len` counts the leading length/token byte, any extension bytes,
/// and the code byte (2, 3, 4, or 6 in total); the token and payload follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub header_len: usize,
    pub token_len: usize,
    pub payload_len: u64,
}

impl FrameHeader {
    /// Total frame size in bytes: header, token, and payload.
    pub fn total_len(&self) -> u64 {
        self.header_len as u64 + self.token_len as u64 + self.payload_len
    }

    /// Parse the header geometry from the start of `buf`.
    ///
    /// Returns `None` when `buf` holds fewer bytes than the indicated branch
    /// needs before the length can even be computed (e.g. fewer than 5 bytes
    /// when the first nibble announces a 4-byte extension). Never reads past
    /// that prefix.
    pub fn parse(buf: &[u8]) -> Option<FrameHeader> {
        let first = *buf.first()?;
        let token_len = (first & 0x0F) as usize;
        let (payload_len, header_len) = match first >> 4 {
            LEN_EXT8 => {
                if buf.len() < 2 {
                    return None;
                }
                (u64::from(buf[1]) + EXT8_OFFSET, 3)
            }
            LEN_EXT16 => {
                if buf.len() < 3 {
                    return None;
                }
                (u64::from(buf[1]) * 256 + u64::from(buf[2]) + EXT16_OFFSET, 4)
            }
            LEN_EXT32 => {
                if buf.len() < 5 {
                    return None;
                }
                let ext = ((u64::from(buf[1]) * 256 + u64::from(buf[2])) * 256
                    + u64::from(buf[3]))
                    * 256
                    + u64::from(buf[4]);
                (ext + EXT32_OFFSET, 6)
            }
            literal => (u64::from(literal), 2),
        };
        Some(FrameHeader {
            header_len,
            token_len,
            payload_len,
        })
    }
}

/// One complete frame copied out of a stream buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    header_len: usize,
    token_len: usize,
}

impl Frame {
    /// The full frame as it appeared on the wire, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of buffer bytes this frame consumed; equals `bytes().len()`.
    pub fn consumed(&self) -> usize {
        self.bytes.len()
    }

    /// The message code byte (last byte of the header).
    pub fn code(&self) -> u8 {
        self.bytes[self.header_len - 1]
    }

    pub fn token(&self) -> &[u8] {
        &self.bytes[self.header_len..self.header_len + self.token_len]
    }

    /// Everything after the token: options and payload of the message.
    pub fn payload(&self) -> &[u8] {
        &self.bytes[self.header_len + self.token_len..]
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Result of attempting to pull one frame off the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// The buffer does not yet hold one complete frame.
    NeedMoreData,
    /// One complete frame, copied out of the buffer.
    Frame(Frame),
}

/// Try to extract one complete frame from the front of `buf`.
///
/// Never mutates or over-reads the input; on success the caller removes
/// [`Frame::consumed`] bytes and keeps the remainder as carry-over for the
/// next read. Several frames may arrive in one read, so callers invoke this
/// repeatedly against the shrinking buffer until it reports `NeedMoreData`.
pub fn try_extract_frame(buf: &[u8]) -> Extract {
    let Some(header) = FrameHeader::parse(buf) else {
        return Extract::NeedMoreData;
    };
    if (buf.len() as u64) < header.total_len() {
        return Extract::NeedMoreData;
    }
    let total = header.total_len() as usize;
    Extract::Frame(Frame {
        bytes: buf[..total].to_vec(),
        header_len: header.header_len,
        token_len: header.token_len,
    })
}

/// Encode one frame: length/token byte, extension bytes, code, token, payload.
///
/// Chooses the smallest-width length branch that represents `payload.len()`.
pub fn encode_frame(code: u8, token: &[u8], payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(FrameError::TokenTooLong {
            max: MAX_TOKEN_LEN,
            actual: token.len(),
        });
    }
    let len = payload.len() as u64;
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_LEN,
            actual: len,
        });
    }

    let tkl = token.len() as u8;
    let mut out = Vec::with_capacity(6 + token.len() + payload.len());
    if len <= 12 {
        out.push((len as u8) << 4 | tkl);
    } else if len < EXT16_OFFSET {
        out.push(LEN_EXT8 << 4 | tkl);
        out.push((len - EXT8_OFFSET) as u8);
    } else if len < EXT32_OFFSET {
        out.push(LEN_EXT16 << 4 | tkl);
        out.extend_from_slice(&((len - EXT16_OFFSET) as u16).to_be_bytes());
    } else {
        out.push(LEN_EXT32 << 4 | tkl);
        out.extend_from_slice(&((len - EXT32_OFFSET) as u32).to_be_bytes());
    }
    out.push(code);
    out.extend_from_slice(token);
    out.extend_from_slice(payload);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(code: u8, token: &[u8], payload: &[u8]) -> Frame {
        let encoded = encode_frame(code, token, payload).unwrap();
        match try_extract_frame(&encoded) {
            Extract::Frame(frame) => {
                assert_eq!(frame.consumed(), encoded.len());
                frame
            }
            Extract::NeedMoreData => panic!("complete frame should extract"),
        }
    }

    #[test]
    fn empty_payload_no_token() {
        let frame = roundtrip(0x45, &[], &[]);
        assert_eq!(frame.bytes(), &[0x00, 0x45]);
        assert_eq!(frame.code(), 0x45);
        assert!(frame.token().is_empty());
        assert!(frame.payload().is_empty());
    }

    #[test]
    fn token_adds_to_total_size() {
        let frame = roundtrip(0x01, &[0xAA, 0xBB], &[1, 2, 3, 4, 5]);
        // 2-byte header + 2-byte token + 5-byte payload
        assert_eq!(frame.consumed(), 9);
        assert_eq!(frame.bytes()[0], 0x52);
        assert_eq!(frame.token(), &[0xAA, 0xBB]);
        assert_eq!(frame.payload(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn literal_form_upper_boundary() {
        let encoded = encode_frame(0x01, &[], &[0u8; 12]).unwrap();
        assert_eq!(encoded[0] >> 4, 12);
        assert_eq!(encoded.len(), 2 + 12);
    }

    #[test]
    fn ext8_lower_boundary() {
        // 13 forces the 1-extra-byte form with extension byte 0
        let encoded = encode_frame(0x01, &[], &[0u8; 13]).unwrap();
        assert_eq!(encoded[0] >> 4, 13);
        assert_eq!(encoded[1], 0);
        assert_eq!(encoded.len(), 3 + 13);
        let frame = roundtrip(0x01, &[], &[0u8; 13]);
        assert_eq!(frame.payload().len(), 13);
    }

    #[test]
    fn ext8_upper_boundary() {
        // 268 is the last value in the 1-extra-byte form (extension byte 255)
        let encoded = encode_frame(0x01, &[], &[0u8; 268]).unwrap();
        assert_eq!(encoded[0] >> 4, 13);
        assert_eq!(encoded[1], 255);
        assert_eq!(encoded.len(), 3 + 268);
    }

    #[test]
    fn ext16_lower_boundary() {
        // 269 forces the 2-extra-byte form with extension bytes (0, 0)
        let encoded = encode_frame(0x01, &[], &[0u8; 269]).unwrap();
        assert_eq!(encoded[0] >> 4, 14);
        assert_eq!(&encoded[1..3], &[0, 0]);
        assert_eq!(encoded.len(), 4 + 269);
        let frame = roundtrip(0x01, &[], &[0u8; 269]);
        assert_eq!(frame.payload().len(), 269);
    }

    #[test]
    fn ext16_upper_boundary() {
        let encoded = encode_frame(0x01, &[], &[0u8; 65804]).unwrap();
        assert_eq!(encoded[0] >> 4, 14);
        assert_eq!(&encoded[1..3], &[0xFF, 0xFF]);
    }

    #[test]
    fn ext32_lower_boundary() {
        let encoded = encode_frame(0x01, &[], &[0u8; 65805]).unwrap();
        assert_eq!(encoded[0] >> 4, 15);
        assert_eq!(&encoded[1..5], &[0, 0, 0, 0]);
        assert_eq!(encoded.len(), 6 + 65805);
        let frame = roundtrip(0x01, &[], &[0u8; 65805]);
        assert_eq!(frame.payload().len(), 65805);
    }

    #[test]
    fn need_more_data_on_empty_buffer() {
        assert_eq!(try_extract_frame(&[]), Extract::NeedMoreData);
    }

    #[test]
    fn need_more_data_before_length_is_computable() {
        // 1-byte extension announced, extension byte missing
        assert_eq!(try_extract_frame(&[0xD0]), Extract::NeedMoreData);
        // 2-byte extension announced, only one extension byte present
        assert_eq!(try_extract_frame(&[0xE0, 0x01]), Extract::NeedMoreData);
        // 4-byte extension announced, fewer than 5 bytes available
        assert_eq!(
            try_extract_frame(&[0xF0, 0x00, 0x00, 0x01]),
            Extract::NeedMoreData
        );
    }

    #[test]
    fn need_more_data_on_partial_body() {
        let encoded = encode_frame(0x01, &[0x11], &[0u8; 20]).unwrap();
        for cut in 0..encoded.len() {
            assert_eq!(
                try_extract_frame(&encoded[..cut]),
                Extract::NeedMoreData,
                "prefix of {cut} bytes should be incomplete"
            );
        }
    }

    #[test]
    fn consecutive_frames_extract_one_at_a_time() {
        let a = encode_frame(0x01, &[], b"aaa").unwrap();
        let b = encode_frame(0x02, &[0xFF], b"bb").unwrap();
        let mut buf = a.clone();
        buf.extend_from_slice(&b);

        let Extract::Frame(first) = try_extract_frame(&buf) else {
            panic!("first frame should extract");
        };
        assert_eq!(first.bytes(), &a[..]);

        let rest = &buf[first.consumed()..];
        let Extract::Frame(second) = try_extract_frame(rest) else {
            panic!("second frame should extract");
        };
        assert_eq!(second.bytes(), &b[..]);
        assert_eq!(second.consumed(), rest.len());
    }

    #[test]
    fn header_parse_geometry() {
        let encoded = encode_frame(0xE1, &[1, 2, 3], &[0u8; 300]).unwrap();
        let header = FrameHeader::parse(&encoded).unwrap();
        assert_eq!(header.header_len, 4);
        assert_eq!(header.token_len, 3);
        assert_eq!(header.payload_len, 300);
        assert_eq!(header.total_len(), encoded.len() as u64);
    }

    #[test]
    fn token_too_long_rejected() {
        let err = encode_frame(0x01, &[0u8; 16], &[]).unwrap_err();
        assert_eq!(
            err,
            FrameError::TokenTooLong {
                max: MAX_TOKEN_LEN,
                actual: 16
            }
        );
    }
}
