//! Core Node struct and async event loop.
//!
//! The node builds one channel per configured listener, pumps each channel's
//! events into log output (optionally echoing application frames back), and
//! runs until told to shut down.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use coapstream_core::constants::CSM_CODE;
use coapstream_core::signal::decode_csm;
use coapstream_transport::tls::{load_cert_chain, load_private_key};
use coapstream_transport::{
    Channel, ChannelConfig, InMemoryPskStore, SecurityEvent, ServerSecurity, TransportEvent,
};

use crate::config::{NodeConfig, parse_socket_addr};
use crate::error::NodeError;

/// A transport node hosting the configured listeners.
pub struct Node {
    config: NodeConfig,
    channels: Vec<Channel>,
    pump_handles: Vec<JoinHandle<()>>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Cloneable handle that can signal the node to shut down.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

impl Node {
    /// Create a new node from configuration.
    pub fn new(config: NodeConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            channels: Vec::new(),
            pump_handles: Vec::new(),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Signal the node to shut down.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    fn channel_config(&self) -> ChannelConfig {
        let mut config = ChannelConfig::default();
        config.capabilities.max_message_size = self.config.node.max_message_size;
        config
    }

    /// Build all listeners from the config and start them.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if !self.channels.is_empty() {
            return Err(NodeError::AlreadyRunning);
        }

        let channel_config = self.channel_config();

        // Snapshot the listener entries; spawn_pump borrows self mutably.
        let tcp_entries = self.config.listeners.tcp.clone();
        let tls_entries = self.config.listeners.tls.clone();

        for entry in &tcp_entries {
            let bind = parse_socket_addr(&entry.bind)?;
            let channel = Channel::tcp_server(bind).with_config(channel_config);
            channel.start().await?;
            tracing::info!(
                name = %entry.name,
                addr = ?channel.local_addr(),
                "tcp listener started"
            );
            self.spawn_pump(channel, entry.name.clone());
        }

        if !tls_entries.is_empty() {
            let psks = Arc::new(InMemoryPskStore::new());
            for entry in &self.config.psk {
                psks.insert(entry.identity.as_bytes().to_vec(), entry.secret()?);
            }

            for entry in &tls_entries {
                let bind = parse_socket_addr(&entry.bind)?;
                let chain = load_cert_chain(Path::new(&entry.cert))?;
                let key = load_private_key(Path::new(&entry.key))?;
                let security = ServerSecurity::new(chain, key).with_psk_store(psks.clone());
                let channel = Channel::tls_server(bind, security).with_config(channel_config);
                channel.start().await?;
                tracing::info!(
                    name = %entry.name,
                    addr = ?channel.local_addr(),
                    "tls listener started"
                );
                self.spawn_pump(channel, entry.name.clone());
            }
        }

        Ok(())
    }

    fn spawn_pump(&mut self, channel: Channel, name: String) {
        let echo = self.config.node.echo;
        let stop_rx = self.shutdown_rx.clone();
        let pump_channel = channel.clone();
        self.pump_handles.push(tokio::spawn(async move {
            pump_events(pump_channel, name, echo, stop_rx).await;
        }));
        self.channels.push(channel);
    }

    /// Bound addresses of the started listeners, in configuration order.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.channels.iter().filter_map(Channel::local_addr).collect()
    }

    /// Block until the shutdown signal fires.
    pub async fn run(&mut self) {
        tracing::info!("entering event loop");
        while !*self.shutdown_rx.borrow() {
            if self.shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        tracing::info!("shutdown signal received");
    }

    /// Shut down all channels and clean up.
    pub async fn shutdown(mut self) {
        tracing::info!("shutting down node");
        self.trigger_shutdown();

        for channel in &self.channels {
            channel.stop().await;
        }
        for handle in self.pump_handles.drain(..) {
            let _ = handle.await;
        }

        tracing::info!("node shutdown complete");
    }
}

/// Forward one channel's events to log output, echoing if configured.
async fn pump_events(
    channel: Channel,
    name: String,
    echo: bool,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = channel.next_event() => match event {
                Some(TransportEvent::FrameReceived { frame, peer, session, .. }) => {
                    if frame.code() == CSM_CODE {
                        match decode_csm(&frame) {
                            Ok(caps) => tracing::info!(
                                listener = %name,
                                %peer,
                                block_transfer = caps.block_transfer,
                                max_message_size = caps.max_message_size,
                                "peer capabilities"
                            ),
                            Err(e) => tracing::warn!(
                                listener = %name,
                                %peer,
                                error = %e,
                                "malformed capability signal"
                            ),
                        }
                        continue;
                    }

                    tracing::info!(
                        listener = %name,
                        %peer,
                        code = frame.code(),
                        token = %hex::encode(frame.token()),
                        payload_len = frame.payload().len(),
                        "frame received"
                    );
                    if echo {
                        if let Err(e) = session.send(frame.bytes().to_vec()).await {
                            tracing::debug!(listener = %name, %peer, error = %e, "echo failed");
                        }
                    }
                }
                Some(TransportEvent::Security(SecurityEvent::UnknownPskIdentity { peer, identity })) => {
                    tracing::warn!(
                        listener = %name,
                        %peer,
                        identity = %hex::encode(identity),
                        "unknown key identity"
                    );
                }
                Some(TransportEvent::Security(SecurityEvent::HandshakeFailed { peer, reason })) => {
                    tracing::warn!(listener = %name, %peer, %reason, "handshake failed");
                }
                None => break,
            },
            _ = stop_rx.changed() => break,
        }
    }
}
