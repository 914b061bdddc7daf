//! The security-handshake driver and its engine capability interface.
//!
//! A handshake engine is a sans-I/O byte pump: raw bytes from the socket go
//! in one side, plaintext comes out the other, and the engine accumulates raw
//! bytes it wants written back to the peer. [`drive_handshake`] shuttles
//! those buffers against the stream until the engine reports completion,
//! bounded by a timeout and cancelled by the session's shutdown token. There
//! are no client/server driver variants; the role lives entirely in the
//! engine the caller constructed.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tracing::trace;

use crate::error::TransportError;
use crate::keys::{ClientSecurity, ServerSecurity};
use crate::lock;

/// Read buffer size while handshaking.
const HANDSHAKE_RECV_BUFFER: usize = 2048;

/// TLS protocol versions the transport can be bounded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

/// Handshake policy shared by client and server sessions.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    /// Lowest protocol version the engine will negotiate.
    pub min_version: TlsVersion,
    /// Highest protocol version the engine will negotiate.
    pub max_version: TlsVersion,
    /// Backoff between polls when neither side has bytes to move.
    pub poll_interval: Duration,
    /// Overall bound on the handshake; expiry fails the connect/accept.
    pub timeout: Duration,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            min_version: TlsVersion::V1_2,
            max_version: TlsVersion::V1_3,
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(30),
        }
    }
}

/// The authenticated identity a completed handshake established for the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCredential {
    /// DER encoding of the peer's end-entity certificate.
    Certificate(Vec<u8>),
    /// The PSK identity the peer authenticated with.
    PskIdentity(Vec<u8>),
}

/// Capability interface of a security-handshake / record-layer engine.
///
/// The same object serves both phases: while [`is_handshaking`] is true the
/// driver owns the byte shuttling; afterwards the session feeds received
/// bytes through `offer_input`/`take_input` and seals outbound payloads with
/// `offer_output`/`take_output`.
///
/// [`is_handshaking`]: HandshakeEngine::is_handshaking
pub trait HandshakeEngine: Send {
    /// Feed raw bytes received from the peer.
    fn offer_input(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Take whatever plaintext the engine has produced. May be empty.
    fn take_input(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Offer plaintext to be sealed for the peer.
    fn offer_output(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Take the raw bytes the engine wants written to the socket. May be empty.
    fn take_output(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Whether the handshake is still in progress.
    fn is_handshaking(&self) -> bool;

    /// The peer's authenticated credential, once the handshake completed.
    fn peer_credential(&self) -> Option<PeerCredential>;
}

/// Constructs handshake engines for a channel's sessions.
///
/// The default implementation is [`crate::tls::TlsEngineFactory`]; a channel
/// can carry a different factory to plug in another record layer (the
/// scripted PSK engine in [`crate::testing`] goes in this way).
pub trait EngineFactory: Send + Sync {
    fn client(
        &self,
        peer: SocketAddr,
        security: &ClientSecurity,
        config: &HandshakeConfig,
    ) -> Result<Box<dyn HandshakeEngine>, TransportError>;

    fn server(
        &self,
        security: &ServerSecurity,
        config: &HandshakeConfig,
    ) -> Result<Box<dyn HandshakeEngine>, TransportError>;
}

/// Drive `engine` to handshake completion against the stream halves.
///
/// Each iteration writes out whatever the engine wants sent, then waits up to
/// the poll interval for raw bytes to feed back in. The loop ends when the
/// engine leaves its handshaking state, the timeout expires
/// ([`TransportError::HandshakeTimeout`]), the stop token fires
/// ([`TransportError::Aborted`]), or the stream closes underneath it.
///
/// Returns the peer credential the engine negotiated, if any.
pub async fn drive_handshake(
    engine: &Mutex<Box<dyn HandshakeEngine>>,
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    config: &HandshakeConfig,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<Option<PeerCredential>, TransportError> {
    let deadline = tokio::time::Instant::now() + config.timeout;
    let mut buf = vec![0u8; HANDSHAKE_RECV_BUFFER];

    loop {
        if *stop_rx.borrow() {
            return Err(TransportError::Aborted);
        }

        let pending = lock(engine).take_output()?;
        if !pending.is_empty() {
            trace!(len = pending.len(), "handshake bytes out");
            writer.write_all(&pending).await?;
        }

        if !lock(engine).is_handshaking() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TransportError::HandshakeTimeout);
        }

        tokio::select! {
            result = tokio::time::timeout(config.poll_interval, reader.read(&mut buf)) => {
                match result {
                    Ok(Ok(0)) => {
                        return Err(TransportError::Handshake(
                            "stream closed during handshake".into(),
                        ));
                    }
                    Ok(Ok(n)) => {
                        trace!(len = n, "handshake bytes in");
                        lock(engine).offer_input(&buf[..n])?;
                    }
                    Ok(Err(e)) => return Err(e.into()),
                    // Nothing arrived within the poll interval; loop around.
                    Err(_) => {}
                }
            }
            _ = stop_rx.changed() => return Err(TransportError::Aborted),
        }
    }

    // Flush the engine's final flight before reporting completion.
    let trailing = lock(engine).take_output()?;
    if !trailing.is_empty() {
        writer.write_all(&trailing).await?;
    }

    Ok(lock(engine).peer_credential())
}
