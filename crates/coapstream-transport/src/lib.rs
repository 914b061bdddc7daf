//! Reliable-stream transport for CoAP (RFC 8323).
//!
//! A [`Channel`] multiplexes many peer connections behind one listening and
//! sending surface; each peer gets a [`Session`] owning the stream, the
//! read-side frame reassembly, and the outbound write queue. Secure channels
//! interpose a record-layer engine (rustls by default) between the socket and
//! the framing logic, driven to completion by the handshake driver before any
//! application frame moves.

pub mod channel;
pub mod error;
pub mod event;
pub mod framing;
pub mod handshake;
pub mod keys;
pub mod queue;
pub mod session;
pub mod shutdown;
pub mod testing;
pub mod tls;

pub use channel::{Channel, ChannelConfig};
pub use error::TransportError;
pub use event::{SecurityEvent, TransportEvent};
pub use framing::FrameAccumulator;
pub use handshake::{
    EngineFactory, HandshakeConfig, HandshakeEngine, PeerCredential, TlsVersion, drive_handshake,
};
pub use keys::{ClientCredential, ClientSecurity, InMemoryPskStore, PskStore, ServerSecurity};
pub use session::{Session, SessionState};
pub use shutdown::ShutdownToken;

/// Lock a mutex, recovering the inner value if a holder panicked.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
