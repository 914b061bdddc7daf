//! Error types for the node binary.

use coapstream_transport::TransportError;

/// Errors that can occur during node operation.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("node already running")]
    AlreadyRunning,
}
