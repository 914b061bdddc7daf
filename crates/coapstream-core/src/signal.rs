//! Capability signal (CSM) encoding and decoding.
//!
//! The CSM is the first frame either side sends once a connection (or its
//! security handshake) is established. It advertises the transport-level
//! capabilities of the sender: whether block-wise transfers are supported and
//! the maximum message size the sender is willing to receive. Only the two
//! options the transport itself emits are modeled here; anything else in an
//! inbound CSM is skipped over and left to the layer above.

extern crate alloc;
use alloc::vec::Vec;

use crate::constants::{
    CSM_CODE, DEFAULT_MAX_MESSAGE_SIZE, OPT_BLOCK_WISE_TRANSFER, OPT_MAX_MESSAGE_SIZE,
    PAYLOAD_MARKER,
};
use crate::error::SignalError;
use crate::frame::Frame;

/// Transport capabilities carried by a CSM frame.
///
/// Defaults match the values a session assumes before any CSM arrives:
/// block transfer supported, 1152-byte maximum message size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub block_transfer: bool,
    pub max_message_size: u32,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            block_transfer: true,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Encode a complete CSM frame (framing header, code, options) for `caps`.
///
/// Options are emitted in ascending option-number order: Max-Message-Size (2)
/// first, then Block-Wise-Transfer (4) when advertised. The token is empty.
pub fn encode_csm(caps: &Capabilities) -> Vec<u8> {
    let mut options = Vec::with_capacity(8);
    let mut last_option = 0u16;

    push_option(
        &mut options,
        &mut last_option,
        OPT_MAX_MESSAGE_SIZE,
        &encode_uint(caps.max_message_size),
    );
    if caps.block_transfer {
        push_option(&mut options, &mut last_option, OPT_BLOCK_WISE_TRANSFER, &[]);
    }

    // Both options fit in the literal length form.
    debug_assert!(options.len() <= 12);
    let mut out = Vec::with_capacity(2 + options.len());
    out.push((options.len() as u8) << 4);
    out.push(CSM_CODE);
    out.extend_from_slice(&options);
    out
}

/// Decode the capabilities advertised by a CSM frame.
///
/// Returns [`SignalError::NotCsm`] when the frame's code is not 7.01. Options
/// other than Max-Message-Size and Block-Wise-Transfer are skipped. An absent
/// Max-Message-Size option means the protocol default (1152); block transfer
/// is reported only when its option is present.
pub fn decode_csm(frame: &Frame) -> Result<Capabilities, SignalError> {
    if frame.code() != CSM_CODE {
        return Err(SignalError::NotCsm { code: frame.code() });
    }

    let mut caps = Capabilities {
        block_transfer: false,
        max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
    };

    let buf = frame.payload();
    let mut pos = 0usize;
    let mut option = 0u32;
    while pos < buf.len() {
        if buf[pos] == PAYLOAD_MARKER {
            // Application payload follows; no further options.
            break;
        }
        let (delta, len, next) = decode_option_header(buf, pos)?;
        option += delta;
        if next + len > buf.len() {
            return Err(SignalError::TruncatedOption);
        }
        let value = &buf[next..next + len];
        if option == u32::from(OPT_MAX_MESSAGE_SIZE) {
            caps.max_message_size = decode_uint(OPT_MAX_MESSAGE_SIZE, value)?;
        } else if option == u32::from(OPT_BLOCK_WISE_TRANSFER) {
            caps.block_transfer = true;
        }
        pos = next + len;
    }
    Ok(caps)
}

/// Append one option, delta-encoded against the previous option number.
fn push_option(out: &mut Vec<u8>, last_option: &mut u16, option: u16, value: &[u8]) {
    let delta = option - *last_option;
    *last_option = option;
    debug_assert!(delta < 13 && value.len() < 13);
    out.push(((delta as u8) << 4) | value.len() as u8);
    out.extend_from_slice(value);
}

/// Decode one option's delta/length header starting at `pos`.
///
/// Returns (delta, value length, offset of the value). Nibble 13 escapes to a
/// 1-byte extension (+13), nibble 14 to a 2-byte big-endian extension (+269);
/// nibble 15 is reserved outside the payload marker.
fn decode_option_header(buf: &[u8], pos: usize) -> Result<(u32, usize, usize), SignalError> {
    let first = buf[pos];
    let mut next = pos + 1;

    let mut field = |nibble: u8| -> Result<u32, SignalError> {
        match nibble {
            13 => {
                let ext = *buf.get(next).ok_or(SignalError::TruncatedOption)?;
                next += 1;
                Ok(u32::from(ext) + 13)
            }
            14 => {
                if next + 2 > buf.len() {
                    return Err(SignalError::TruncatedOption);
                }
                let ext = u32::from(buf[next]) * 256 + u32::from(buf[next + 1]);
                next += 2;
                Ok(ext + 269)
            }
            15 => Err(SignalError::ReservedOptionNibble),
            literal => Ok(u32::from(literal)),
        }
    };

    let delta = field(first >> 4)?;
    let len = field(first & 0x0F)?;
    Ok((delta, len as usize, next))
}

/// Minimal-length big-endian unsigned integer, as CoAP encodes option values.
fn encode_uint(value: u32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|&&b| b == 0).count();
    bytes[skip..].to_vec()
}

fn decode_uint(option: u16, value: &[u8]) -> Result<u32, SignalError> {
    if value.len() > 4 {
        return Err(SignalError::OptionValueTooLong {
            option,
            len: value.len(),
        });
    }
    let mut out = 0u32;
    for &b in value {
        out = out << 8 | u32::from(b);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Extract, try_extract_frame};

    fn decode_bytes(bytes: &[u8]) -> Frame {
        match try_extract_frame(bytes) {
            Extract::Frame(frame) => frame,
            Extract::NeedMoreData => panic!("CSM bytes should form a complete frame"),
        }
    }

    #[test]
    fn default_csm_golden_bytes() {
        let encoded = encode_csm(&Capabilities::default());
        // len 4 / token 0, code 7.01, Max-Message-Size 1152, Block-Wise-Transfer
        assert_eq!(encoded, [0x40, 0xE1, 0x22, 0x04, 0x80, 0x20]);
    }

    #[test]
    fn roundtrip_default() {
        let encoded = encode_csm(&Capabilities::default());
        let caps = decode_csm(&decode_bytes(&encoded)).unwrap();
        assert_eq!(caps, Capabilities::default());
    }

    #[test]
    fn roundtrip_without_block_transfer() {
        let caps = Capabilities {
            block_transfer: false,
            max_message_size: 16384,
        };
        let encoded = encode_csm(&caps);
        assert_eq!(decode_csm(&decode_bytes(&encoded)).unwrap(), caps);
    }

    #[test]
    fn max_message_size_uses_minimal_width() {
        let encoded = encode_csm(&Capabilities {
            block_transfer: false,
            max_message_size: 0x7F,
        });
        // delta 2 / length 1, single value byte
        assert_eq!(&encoded[2..], [0x21, 0x7F]);
    }

    #[test]
    fn absent_options_fall_back_to_defaults() {
        // A CSM with no options at all
        let frame = decode_bytes(&[0x00, 0xE1]);
        let caps = decode_csm(&frame).unwrap();
        assert!(!caps.block_transfer);
        assert_eq!(caps.max_message_size, DEFAULT_MAX_MESSAGE_SIZE);
    }

    #[test]
    fn unknown_options_are_skipped() {
        // Option 1 (len 1), then Max-Message-Size (delta 1, len 2)
        let frame = decode_bytes(&[0x50, 0xE1, 0x11, 0xAA, 0x12, 0x10, 0x00]);
        let caps = decode_csm(&frame).unwrap();
        assert_eq!(caps.max_message_size, 4096);
    }

    #[test]
    fn extended_option_delta_decodes() {
        // Option 30 = delta nibble 13, extension 17; empty value
        let frame = decode_bytes(&[0x20, 0xE1, 0xD0, 17]);
        // Nothing we recognize, but it must parse cleanly
        let caps = decode_csm(&frame).unwrap();
        assert!(!caps.block_transfer);
    }

    #[test]
    fn non_csm_code_rejected() {
        let frame = decode_bytes(&[0x00, 0x45]);
        assert_eq!(decode_csm(&frame), Err(SignalError::NotCsm { code: 0x45 }));
    }

    #[test]
    fn truncated_option_value_rejected() {
        // Declares a 2-byte value but carries only one
        let frame = decode_bytes(&[0x20, 0xE1, 0x22, 0x04]);
        assert_eq!(decode_csm(&frame), Err(SignalError::TruncatedOption));
    }

    #[test]
    fn reserved_nibble_rejected() {
        let frame = decode_bytes(&[0x10, 0xE1, 0xF0]);
        assert_eq!(decode_csm(&frame), Err(SignalError::ReservedOptionNibble));
    }

    #[test]
    fn oversized_uint_rejected() {
        // Max-Message-Size with a 5-byte value
        let frame = decode_bytes(&[0x60, 0xE1, 0x25, 1, 2, 3, 4, 5]);
        assert_eq!(
            decode_csm(&frame),
            Err(SignalError::OptionValueTooLong { option: 2, len: 5 })
        );
    }

    #[test]
    fn options_stop_at_payload_marker() {
        // Block-Wise-Transfer, payload marker, then junk that is not options
        let frame = decode_bytes(&[0x40, 0xE1, 0x40, 0xFF, 0xF0, 0xF0]);
        let caps = decode_csm(&frame).unwrap();
        assert!(caps.block_transfer);
    }
}
