//! Error types for the transport layer.

use coapstream_core::FrameError;

/// Errors surfaced by channels, sessions, and the handshake driver.
///
/// Transient read/write failures on an established session are not surfaced
/// through this type at all; the session logs them and treats them as an
/// implicit termination.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("operation aborted")]
    Aborted,
    #[error("unknown PSK identity: {}", hex::encode(identity))]
    UnknownPskIdentity { identity: Vec<u8> },
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("declared frame of {declared} bytes exceeds the {limit}-byte limit")]
    OversizedFrame { declared: u64, limit: usize },
    #[error("session closed")]
    SessionClosed,
    #[error("channel stopped")]
    Stopped,
}
