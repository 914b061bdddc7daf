//! Channel: one listening/sending surface multiplexing per-peer sessions.
//!
//! A channel owns its own session registry, its event queue, and (for
//! servers) the accept loop. Sessions are created lazily on the client side:
//! sending to an address with no live session connects, handshakes, and
//! registers one under the registry lock, so concurrent sends to a new peer
//! still produce exactly one session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::event::{SecurityEvent, TransportEvent};
use crate::framing::DEFAULT_MAX_FRAME_LEN;
use crate::handshake::{EngineFactory, HandshakeConfig};
use crate::keys::{ClientSecurity, ServerSecurity};
use crate::lock;
use crate::session::{Session, SessionState};
use crate::shutdown::ShutdownToken;
use crate::tls::TlsEngineFactory;

use coapstream_core::signal::Capabilities;

/// Depth of the channel's event queue.
const EVENT_QUEUE_DEPTH: usize = 256;

/// Tunables shared by every session the channel creates.
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub handshake: HandshakeConfig,
    /// Ceiling on a single inbound frame's declared size.
    pub max_frame_len: usize,
    /// Capabilities advertised in this side's capability signal.
    pub capabilities: Capabilities,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            capabilities: Capabilities::default(),
        }
    }
}

struct ChannelInner {
    bind: Option<SocketAddr>,
    secure: bool,
    server_security: Option<Arc<ServerSecurity>>,
    client_security: StdMutex<Option<Arc<ClientSecurity>>>,
    factory: StdMutex<Arc<dyn EngineFactory>>,
    config: StdMutex<ChannelConfig>,
    registry: Mutex<HashMap<SocketAddr, Session>>,
    // One guard per destination so racing connects to the same new peer
    // serialize without stalling sends to unrelated peers.
    connect_locks: Mutex<HashMap<SocketAddr, Arc<Mutex<()>>>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    local_addr: StdMutex<Option<SocketAddr>>,
    shutdown: ShutdownToken,
}

/// Cloneable handle to a transport channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    fn build(
        bind: Option<SocketAddr>,
        secure: bool,
        server_security: Option<ServerSecurity>,
        client_security: Option<ClientSecurity>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        Self {
            inner: Arc::new(ChannelInner {
                bind,
                secure,
                server_security: server_security.map(Arc::new),
                client_security: StdMutex::new(client_security.map(Arc::new)),
                factory: StdMutex::new(Arc::new(TlsEngineFactory)),
                config: StdMutex::new(ChannelConfig::default()),
                registry: Mutex::new(HashMap::new()),
                connect_locks: Mutex::new(HashMap::new()),
                events_tx,
                events_rx: Mutex::new(events_rx),
                local_addr: StdMutex::new(None),
                shutdown: ShutdownToken::new(),
            }),
        }
    }

    /// A plaintext server channel listening on `bind`.
    pub fn tcp_server(bind: SocketAddr) -> Self {
        Self::build(Some(bind), false, None, None)
    }

    /// A plaintext client-only channel.
    pub fn tcp_client() -> Self {
        Self::build(None, false, None, None)
    }

    /// A secure server channel listening on `bind`.
    pub fn tls_server(bind: SocketAddr, security: ServerSecurity) -> Self {
        Self::build(Some(bind), true, Some(security), None)
    }

    /// A secure client-only channel originating with `security`.
    pub fn tls_client(security: ClientSecurity) -> Self {
        Self::build(None, true, None, Some(security))
    }

    /// Replace the credential used for outgoing secure connections.
    pub fn with_client_security(self, security: ClientSecurity) -> Self {
        *lock(&self.inner.client_security) = Some(Arc::new(security));
        self
    }

    /// Replace the handshake-engine factory. Affects sessions created after
    /// the call.
    pub fn with_engine_factory(self, factory: Arc<dyn EngineFactory>) -> Self {
        *lock(&self.inner.factory) = factory;
        self
    }

    pub fn with_config(self, config: ChannelConfig) -> Self {
        *lock(&self.inner.config) = config;
        self
    }

    /// Bring the channel online; server channels start accepting.
    pub async fn start(&self) -> Result<(), TransportError> {
        if let Some(bind) = self.inner.bind {
            let listener = bind_listener(bind)?;
            let local = listener.local_addr()?;
            *lock(&self.inner.local_addr) = Some(local);
            info!(%local, secure = self.inner.secure, "channel listening");

            let channel = self.clone();
            let mut stop_rx = self.inner.shutdown.subscribe();
            let handle = tokio::spawn(async move {
                channel.accept_loop(listener, &mut stop_rx).await;
            });
            self.inner.shutdown.add_task(handle).await;
        }
        self.inner.shutdown.set_online();
        Ok(())
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        stop_rx: &mut tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(%peer, "inbound connection");
                        let channel = self.clone();
                        tokio::spawn(async move {
                            channel.admit(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "accept failed");
                    }
                },
                _ = stop_rx.changed() => break,
            }
        }
    }

    /// Handshake and register an accepted connection.
    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let config = *lock(&self.inner.config);
        let engine = if self.inner.secure {
            let factory = Arc::clone(&lock(&self.inner.factory));
            let Some(security) = self.inner.server_security.as_deref() else {
                warn!(%peer, "secure channel without server credentials");
                return;
            };
            match factory.server(security, &config.handshake) {
                Ok(engine) => Some(engine),
                Err(e) => {
                    warn!(%peer, error = %e, "engine construction failed");
                    return;
                }
            }
        } else {
            None
        };

        match Session::establish(
            stream,
            engine,
            config.capabilities,
            config.max_frame_len,
            config.handshake,
            self.inner.events_tx.clone(),
        )
        .await
        {
            Ok(session) => {
                // Register before the read loop runs so lookups never miss a
                // session whose frames are already being delivered.
                let replaced = self
                    .inner
                    .registry
                    .lock()
                    .await
                    .insert(peer, session.clone());
                session.start_reading().await;
                // A reconnecting peer supersedes its old session.
                if let Some(old) = replaced {
                    old.abort().await;
                }
            }
            Err(TransportError::UnknownPskIdentity { identity }) => {
                warn!(%peer, identity = %hex::encode(&identity), "unknown key identity");
                let event =
                    TransportEvent::Security(SecurityEvent::UnknownPskIdentity { peer, identity });
                let _ = self.inner.events_tx.send(event).await;
            }
            Err(e) => {
                debug!(%peer, error = %e, "inbound handshake failed");
                let event = TransportEvent::Security(SecurityEvent::HandshakeFailed {
                    peer,
                    reason: e.to_string(),
                });
                let _ = self.inner.events_tx.send(event).await;
            }
        }
    }

    /// The live session for `dest`, connecting one if none exists.
    ///
    /// Connects to the same new peer serialize on a per-destination guard,
    /// so two concurrent callers racing toward it end up sharing one session
    /// instead of opening two; connects to distinct peers proceed in
    /// parallel.
    pub async fn connect(&self, dest: SocketAddr) -> Result<Session, TransportError> {
        if self.inner.shutdown.is_stopped() {
            return Err(TransportError::Stopped);
        }

        let connect_lock = {
            let mut locks = self.inner.connect_locks.lock().await;
            Arc::clone(locks.entry(dest).or_default())
        };
        let _guard = connect_lock.lock().await;

        {
            let mut registry = self.inner.registry.lock().await;
            if let Some(session) = registry.get(&dest) {
                if session.state() != SessionState::Closed {
                    return Ok(session.clone());
                }
                registry.remove(&dest);
            }
        }

        let config = *lock(&self.inner.config);
        let stream = TcpStream::connect(dest).await?;
        let engine = if self.inner.secure {
            let security = lock(&self.inner.client_security)
                .clone()
                .ok_or_else(|| {
                    TransportError::Configuration(
                        "secure channel has no client credentials".into(),
                    )
                })?;
            let factory = Arc::clone(&lock(&self.inner.factory));
            Some(factory.client(dest, &security, &config.handshake)?)
        } else {
            None
        };

        let session = Session::establish(
            stream,
            engine,
            config.capabilities,
            config.max_frame_len,
            config.handshake,
            self.inner.events_tx.clone(),
        )
        .await?;
        self.inner.registry.lock().await.insert(dest, session.clone());
        session.start_reading().await;
        Ok(session)
    }

    /// Queue `data` for `dest`, connecting a session when necessary.
    pub async fn send(&self, dest: SocketAddr, data: Vec<u8>) -> Result<Session, TransportError> {
        let session = self.connect(dest).await?;
        session.send(data).await?;
        Ok(session)
    }

    /// The registered session for `peer`, if one is live.
    pub async fn get_session(&self, peer: SocketAddr) -> Option<Session> {
        self.inner.registry.lock().await.get(&peer).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Drop the peer's session immediately, discarding queued payloads.
    pub async fn abort(&self, peer: SocketAddr) {
        if let Some(session) = self.inner.registry.lock().await.remove(&peer) {
            session.abort().await;
        }
    }

    /// Drain the peer's queued payloads, then close its session.
    pub async fn release(&self, peer: SocketAddr) {
        if let Some(session) = self.inner.registry.lock().await.remove(&peer) {
            session.release().await;
        }
    }

    /// The next event, or `None` once the channel is stopped and drained.
    pub async fn next_event(&self) -> Option<TransportEvent> {
        self.inner.events_rx.lock().await.recv().await
    }

    /// Bound address of a started server channel.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.inner.local_addr)
    }

    pub fn is_online(&self) -> bool {
        self.inner.shutdown.is_online()
    }

    /// Stop accepting, close every session, and await background tasks.
    pub async fn stop(&self) {
        self.inner.shutdown.signal_stop_and_go_offline();
        let sessions: Vec<Session> = self.inner.registry.lock().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close().await;
        }
        self.inner.shutdown.join_all().await;
        info!("channel stopped");
    }
}

/// Bind a listening socket, accepting both address families on IPv6 binds.
fn bind_listener(bind: SocketAddr) -> Result<TcpListener, TransportError> {
    let domain = if bind.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if bind.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.bind(&bind.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into()).map_err(Into::into)
}
