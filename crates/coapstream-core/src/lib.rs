//! Core codecs and constants for CoAP over reliable byte streams (RFC 8323).
//!
//! This crate defines the length-prefixed message framing used on TCP and
//! TLS-over-TCP connections, the capability-signaling (CSM) message codec,
//! and the shared protocol constants. It performs no I/O; the transport
//! layer lives in `coapstream-transport`.

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod constants;
pub mod error;
pub mod frame;
pub mod signal;

pub use constants::{CSM_CODE, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::{FrameError, SignalError};
pub use frame::{Extract, Frame, FrameHeader, encode_frame, try_extract_frame};
pub use signal::{Capabilities, decode_csm, encode_csm};
