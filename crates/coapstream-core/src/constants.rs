//! Protocol constants shared across the transport.

/// Default maximum message size advertised in the capability signal, in bytes.
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 1152;

/// Message code of the Capabilities and Settings Message (7.01).
pub const CSM_CODE: u8 = 0xE1;

/// CSM option number for Max-Message-Size.
pub const OPT_MAX_MESSAGE_SIZE: u16 = 2;

/// CSM option number for Block-Wise-Transfer.
pub const OPT_BLOCK_WISE_TRANSFER: u16 = 4;

/// Marker byte separating options from a message payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;
