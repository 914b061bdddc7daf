//! Events a channel surfaces to the layer above it.

use std::net::SocketAddr;

use coapstream_core::frame::Frame;

use crate::session::Session;

/// A security condition the channel observed while admitting a peer.
///
/// These exist so an application can react to a failed admission, typically
/// by provisioning the missing key and letting the peer retry.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// A connecting client claimed a PSK identity the store could not resolve.
    UnknownPskIdentity {
        peer: SocketAddr,
        identity: Vec<u8>,
    },
    /// A handshake failed for any other reason.
    HandshakeFailed { peer: SocketAddr, reason: String },
}

/// Everything a channel reports upward.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A complete frame arrived on a ready session.
    FrameReceived {
        frame: Frame,
        peer: SocketAddr,
        local: SocketAddr,
        session: Session,
    },
    Security(SecurityEvent),
}
