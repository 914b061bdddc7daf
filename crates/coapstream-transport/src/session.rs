//! One peer connection: stream halves, reassembly, and the outbound queue.
//!
//! A session is created by its channel, either from an outgoing connect or an
//! accepted socket. It becomes [`SessionState::Ready`] only after any
//! handshake engine has been driven to completion; the first payload queued on
//! a ready session is always its own capability signal, ahead of anything the
//! application asked to send. Received bytes pass through the engine (when
//! present), then the frame accumulator, and complete frames are published as
//! channel events.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, trace, warn};

use coapstream_core::constants::CSM_CODE;
use coapstream_core::frame::Frame;
use coapstream_core::signal::{Capabilities, decode_csm, encode_csm};

use crate::error::TransportError;
use crate::event::TransportEvent;
use crate::framing::FrameAccumulator;
use crate::handshake::{HandshakeConfig, HandshakeEngine, PeerCredential, drive_handshake};
use crate::lock;
use crate::queue::OutboundQueue;
use crate::shutdown::ShutdownToken;

/// Read buffer size for the session's read loop.
const RECV_BUFFER: usize = 8192;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket exists, handshake not yet started.
    Created,
    /// The handshake driver owns the stream.
    Handshaking,
    /// Frames may flow in both directions.
    Ready,
    /// The stream is gone; sends fail and no further events are published.
    Closed,
}

struct SessionInner {
    peer: SocketAddr,
    local: SocketAddr,
    state: StdMutex<SessionState>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    read_half: StdMutex<Option<OwnedReadHalf>>,
    max_frame_len: usize,
    queue: OutboundQueue,
    engine: Option<StdMutex<Box<dyn HandshakeEngine>>>,
    peer_credential: StdMutex<Option<PeerCredential>>,
    peer_capabilities: StdMutex<Option<Capabilities>>,
    events: mpsc::Sender<TransportEvent>,
    shutdown: ShutdownToken,
}

/// Cloneable handle to one peer connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.inner.peer)
            .field("local", &self.inner.local)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Bring up a session on a connected stream.
    ///
    /// Drives the handshake when an engine is present, then promotes the
    /// session to ready and queues and drains the capability signal. No
    /// events fire until the caller invokes [`Session::start_reading`]; the
    /// channel registers the session in between so lookups never miss a
    /// session that is already publishing. Errors tear the stream down.
    pub(crate) async fn establish(
        stream: TcpStream,
        engine: Option<Box<dyn HandshakeEngine>>,
        capabilities: Capabilities,
        max_frame_len: usize,
        handshake: HandshakeConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Session, TransportError> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let (mut read_half, mut write_half) = stream.into_split();

        let session = Session {
            inner: Arc::new(SessionInner {
                peer,
                local,
                state: StdMutex::new(SessionState::Created),
                writer: Mutex::new(None),
                read_half: StdMutex::new(None),
                max_frame_len,
                queue: OutboundQueue::new(),
                engine: engine.map(StdMutex::new),
                peer_credential: StdMutex::new(None),
                peer_capabilities: StdMutex::new(None),
                events,
                shutdown: ShutdownToken::new(),
            }),
        };

        if let Some(engine) = &session.inner.engine {
            session.set_state(SessionState::Handshaking);
            let mut stop_rx = session.inner.shutdown.subscribe();
            let credential = drive_handshake(
                engine,
                &mut read_half,
                &mut write_half,
                &handshake,
                &mut stop_rx,
            )
            .await?;
            *lock(&session.inner.peer_credential) = credential;
        }

        *session.inner.writer.lock().await = Some(write_half);
        session.set_state(SessionState::Ready);
        session.inner.shutdown.set_online();
        debug!(%peer, %local, "session ready");

        // The capability signal leads every conversation; application sends
        // queued before this point stay behind it.
        session.inner.queue.push(encode_csm(&capabilities));
        session.drain().await?;

        *lock(&session.inner.read_half) = Some(read_half);
        Ok(session)
    }

    /// Spawn the read loop. Called once, after the session is registered.
    pub(crate) async fn start_reading(&self) {
        let Some(mut read_half) = lock(&self.inner.read_half).take() else {
            return;
        };
        let reader_session = self.clone();
        let stop_rx = self.inner.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            reader_session.read_loop(&mut read_half, stop_rx).await;
        });
        self.inner.shutdown.add_task(handle).await;
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// The authenticated identity of the peer, when the session is secure.
    pub fn peer_credential(&self) -> Option<PeerCredential> {
        lock(&self.inner.peer_credential).clone()
    }

    /// The capabilities the peer announced in its capability signal, if one
    /// has arrived yet.
    pub fn peer_capabilities(&self) -> Option<Capabilities> {
        lock(&self.inner.peer_capabilities).clone()
    }

    /// Number of payloads queued but not yet written.
    pub fn queued(&self) -> usize {
        self.inner.queue.len()
    }

    fn set_state(&self, state: SessionState) {
        *lock(&self.inner.state) = state;
    }

    /// Queue `data` for transmission and drain the queue.
    ///
    /// The payload is expected to be a complete encoded frame; the session
    /// does not inspect it.
    pub async fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.state() == SessionState::Closed {
            return Err(TransportError::SessionClosed);
        }
        self.inner.queue.push(data);
        self.drain().await
    }

    /// Write queued payloads to the stream, one logical drain at a time.
    ///
    /// Returns without doing anything when the session is not ready yet or
    /// another drain already holds the flag; the holder picks up anything
    /// pushed meanwhile.
    async fn drain(&self) -> Result<(), TransportError> {
        if !self.is_ready() || !self.inner.queue.begin_drain() {
            return Ok(());
        }

        loop {
            while let Some(item) = self.inner.queue.pop() {
                let sealed = self.seal(&item)?;
                let mut writer = self.inner.writer.lock().await;
                let Some(w) = writer.as_mut() else {
                    self.inner.queue.end_drain();
                    return Err(TransportError::SessionClosed);
                };
                if let Err(e) = w.write_all(&sealed).await {
                    debug!(peer = %self.inner.peer, error = %e, "write failed, closing session");
                    drop(writer);
                    self.inner.queue.end_drain();
                    self.close().await;
                    return Err(e.into());
                }
                trace!(peer = %self.inner.peer, len = sealed.len(), "payload written");
            }
            if !self.inner.queue.end_drain() {
                break;
            }
        }
        Ok(())
    }

    fn seal(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        match &self.inner.engine {
            Some(engine) => {
                let mut engine = lock(engine);
                engine.offer_output(data)?;
                engine.take_output()
            }
            None => Ok(data.to_vec()),
        }
    }

    fn unseal(&self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        match &self.inner.engine {
            Some(engine) => {
                let mut engine = lock(engine);
                engine.offer_input(data)?;
                engine.take_input()
            }
            None => Ok(data.to_vec()),
        }
    }

    /// Raw bytes the engine wants on the wire outside a drain, e.g. replies
    /// the record layer generates while decrypting.
    async fn flush_engine_output(&self) -> Result<(), TransportError> {
        let Some(engine) = &self.inner.engine else {
            return Ok(());
        };
        let pending = lock(engine).take_output()?;
        if pending.is_empty() {
            return Ok(());
        }
        let mut writer = self.inner.writer.lock().await;
        if let Some(w) = writer.as_mut() {
            w.write_all(&pending).await?;
        }
        Ok(())
    }

    /// Plaintext the engine already decrypted but nothing has taken yet.
    ///
    /// The handshake driver feeds the engine raw bytes without ever reading
    /// the plaintext side, so a peer whose first frame rides in the same
    /// segment as its final handshake flight leaves that frame buffered in
    /// the engine.
    fn buffered_plaintext(&self) -> Result<Vec<u8>, TransportError> {
        match &self.inner.engine {
            Some(engine) => lock(engine).take_input(),
            None => Ok(Vec::new()),
        }
    }

    async fn read_loop(
        &self,
        read_half: &mut OwnedReadHalf,
        mut stop_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut acc = FrameAccumulator::with_limit(self.inner.max_frame_len);
        let mut buf = vec![0u8; RECV_BUFFER];

        // Surface anything decrypted during the handshake before arming the
        // first read.
        match self.buffered_plaintext() {
            Ok(plaintext) => {
                if !plaintext.is_empty() {
                    match acc.feed(&plaintext) {
                        Ok(frames) => {
                            for frame in frames {
                                self.publish_frame(frame).await;
                            }
                        }
                        Err(e) => {
                            warn!(peer = %self.inner.peer, error = %e, "framing violation, closing session");
                            self.close().await;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                debug!(peer = %self.inner.peer, error = %e, "record layer rejected input");
                self.close().await;
                return;
            }
        }

        loop {
            tokio::select! {
                result = read_half.read(&mut buf) => {
                    let n = match result {
                        Ok(0) => {
                            debug!(peer = %self.inner.peer, "peer closed the stream");
                            break;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            debug!(peer = %self.inner.peer, error = %e, "read failed");
                            break;
                        }
                    };

                    let plaintext = match self.unseal(&buf[..n]) {
                        Ok(p) => p,
                        Err(e) => {
                            debug!(peer = %self.inner.peer, error = %e, "record layer rejected input");
                            break;
                        }
                    };
                    if let Err(e) = self.flush_engine_output().await {
                        debug!(peer = %self.inner.peer, error = %e, "engine flush failed");
                        break;
                    }
                    if plaintext.is_empty() {
                        continue;
                    }

                    let frames = match acc.feed(&plaintext) {
                        Ok(frames) => frames,
                        Err(e) => {
                            warn!(peer = %self.inner.peer, error = %e, "framing violation, closing session");
                            break;
                        }
                    };
                    for frame in frames {
                        self.publish_frame(frame).await;
                    }
                }
                _ = stop_rx.changed() => break,
            }
        }

        self.close().await;
    }

    async fn publish_frame(&self, frame: Frame) {
        if frame.code() == CSM_CODE {
            match decode_csm(&frame) {
                Ok(caps) => {
                    trace!(peer = %self.inner.peer, ?caps, "peer capabilities");
                    *lock(&self.inner.peer_capabilities) = Some(caps);
                }
                Err(e) => {
                    warn!(peer = %self.inner.peer, error = %e, "malformed capability signal");
                }
            }
        }

        let event = TransportEvent::FrameReceived {
            frame,
            peer: self.inner.peer,
            local: self.inner.local,
            session: self.clone(),
        };
        // A dropped receiver means the channel is gone; nothing to do.
        let _ = self.inner.events.send(event).await;
    }

    /// Drop pending payloads and close at once.
    pub async fn abort(&self) {
        self.inner.queue.clear();
        self.close().await;
    }

    /// Drain whatever is queued, then close.
    pub async fn release(&self) {
        let _ = self.drain().await;
        self.close().await;
    }

    /// Close the stream and mark the session closed. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = lock(&self.inner.state);
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.inner.shutdown.signal_stop_and_go_offline();
        if let Some(mut w) = self.inner.writer.lock().await.take() {
            let _ = w.shutdown().await;
        }
        debug!(peer = %self.inner.peer, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use coapstream_core::frame::encode_frame;
    use tokio::net::TcpListener;

    async fn plain_pair() -> (
        Session,
        mpsc::Receiver<TransportEvent>,
        Session,
        mpsc::Receiver<TransportEvent>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let (client_tx, client_rx) = mpsc::channel(16);
        let (server_tx, server_rx) = mpsc::channel(16);

        let client = Session::establish(
            client_stream,
            None,
            Capabilities::default(),
            1024 * 1024,
            HandshakeConfig::default(),
            client_tx,
        )
        .await
        .unwrap();
        client.start_reading().await;
        let server = Session::establish(
            server_stream,
            None,
            Capabilities::default(),
            1024 * 1024,
            HandshakeConfig::default(),
            server_tx,
        )
        .await
        .unwrap();
        server.start_reading().await;
        (client, client_rx, server, server_rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<TransportEvent>) -> Frame {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::FrameReceived { frame, .. } => frame,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn capability_signal_arrives_first() {
        let (client, mut client_rx, _server, mut server_rx) = plain_pair().await;

        let frame = next_frame(&mut server_rx).await;
        assert_eq!(frame.code(), CSM_CODE);
        let frame = next_frame(&mut client_rx).await;
        assert_eq!(frame.code(), CSM_CODE);

        client
            .send(encode_frame(0x02, &[0xAA], b"hello").unwrap())
            .await
            .unwrap();
        let frame = next_frame(&mut server_rx).await;
        assert_eq!(frame.code(), 0x02);
        assert_eq!(frame.payload(), b"hello");
    }

    #[tokio::test]
    async fn peer_capabilities_are_recorded() {
        let (client, mut _client_rx, _server, mut server_rx) = plain_pair().await;
        let _ = next_frame(&mut server_rx).await;

        // The client has processed the server's signal once its own event
        // loop delivered it; poll briefly.
        for _ in 0..50 {
            if client.peer_capabilities().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let caps = client.peer_capabilities().unwrap();
        assert!(caps.block_transfer);
        assert_eq!(caps.max_message_size, 1152);
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (client, _client_rx, _server, _server_rx) = plain_pair().await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
        let err = client.send(vec![0x00, 0x00]).await.unwrap_err();
        assert!(matches!(err, TransportError::SessionClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _client_rx, _server, _server_rx) = plain_pair().await;
        client.close().await;
        client.close().await;
        assert_eq!(client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn frame_coalesced_with_the_handshake_is_surfaced() {
        use crate::keys::InMemoryPskStore;
        use crate::testing::StubServerEngine;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut raw_client = TcpStream::connect(addr).await.unwrap();
        let (server_stream, _) = listener.accept().await.unwrap();

        let store = Arc::new(InMemoryPskStore::new());
        store.insert(b"KeyOne".to_vec(), b"abcDEFghiJKL".to_vec());

        // Handshake hello and a complete frame in one segment, written before
        // the server side even starts its handshake.
        let mut segment = vec![0x01, 6];
        segment.extend_from_slice(b"KeyOne");
        segment.extend_from_slice(&encode_frame(0x02, &[0xAA], b"early").unwrap());
        raw_client.write_all(&segment).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let server = Session::establish(
            server_stream,
            Some(Box::new(StubServerEngine::new(store))),
            Capabilities::default(),
            1024 * 1024,
            HandshakeConfig {
                poll_interval: Duration::from_millis(10),
                ..HandshakeConfig::default()
            },
            tx,
        )
        .await
        .unwrap();
        server.start_reading().await;

        let frame = next_frame(&mut rx).await;
        assert_eq!(frame.code(), 0x02);
        assert_eq!(frame.payload(), b"early");

        server.close().await;
    }

    #[tokio::test]
    async fn sends_hit_the_wire_contiguous_and_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client_stream = TcpStream::connect(addr).await.unwrap();
        let (mut raw_peer, _) = listener.accept().await.unwrap();

        let (tx, _rx) = mpsc::channel(16);
        let session = Session::establish(
            client_stream,
            None,
            Capabilities::default(),
            1024 * 1024,
            HandshakeConfig::default(),
            tx,
        )
        .await
        .unwrap();
        session.start_reading().await;

        let a = encode_frame(0x01, &[0x01], b"alpha").unwrap();
        let b = encode_frame(0x02, &[0x02], b"bravo").unwrap();
        let c = encode_frame(0x03, &[0x03], b"charlie").unwrap();
        session.send(a.clone()).await.unwrap();
        session.send(b.clone()).await.unwrap();
        session.send(c.clone()).await.unwrap();

        let mut expected = encode_csm(&Capabilities::default());
        expected.extend_from_slice(&a);
        expected.extend_from_slice(&b);
        expected.extend_from_slice(&c);

        // Each frame arrives intact and in enqueue order, nothing interleaved.
        let mut wire = vec![0u8; expected.len()];
        tokio::time::timeout(Duration::from_secs(2), raw_peer.read_exact(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wire, expected);

        session.close().await;
    }

    #[tokio::test]
    async fn peer_close_ends_the_session() {
        let (client, _client_rx, server, mut server_rx) = plain_pair().await;
        let _ = next_frame(&mut server_rx).await;

        client.close().await;
        for _ in 0..50 {
            if server.state() == SessionState::Closed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server session never observed the close");
    }
}
