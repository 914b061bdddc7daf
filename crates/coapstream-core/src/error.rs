//! Error types for the coapstream-core crate.

use core::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    TokenTooLong { max: usize, actual: usize },
    PayloadTooLarge { max: u64, actual: u64 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::TokenTooLong { max, actual } => {
                write!(f, "token too long: at most {max} bytes, got {actual}")
            }
            FrameError::PayloadTooLarge { max, actual } => {
                write!(f, "payload too large: at most {max} bytes, got {actual}")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for FrameError {}

#[derive(Debug, PartialEq, Eq)]
pub enum SignalError {
    NotCsm { code: u8 },
    TruncatedOption,
    ReservedOptionNibble,
    OptionValueTooLong { option: u16, len: usize },
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalError::NotCsm { code } => {
                write!(f, "not a capability signal: code 0x{code:02x}")
            }
            SignalError::TruncatedOption => write!(f, "truncated option encoding"),
            SignalError::ReservedOptionNibble => {
                write!(f, "reserved option nibble 15 outside payload marker")
            }
            SignalError::OptionValueTooLong { option, len } => {
                write!(f, "option {option} value too long: {len} bytes")
            }
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for SignalError {}
