//! Scripted handshake engines for exercising the transport without TLS.
//!
//! The stub handshake is a single round trip: the client sends
//! `[0x01, identity_len, identity...]`, the server resolves the identity
//! against its key store and answers `[0x02]`. After that both engines are a
//! passthrough record layer. This keeps the PSK admission path and every
//! driver/session state transition testable with plain byte inspection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::TransportError;
use crate::event::TransportEvent;
use crate::handshake::{EngineFactory, HandshakeConfig, HandshakeEngine, PeerCredential};
use crate::keys::{ClientCredential, ClientSecurity, PskStore, ServerSecurity};

const HELLO: u8 = 0x01;
const ACCEPT: u8 = 0x02;

/// Client side of the scripted handshake.
pub struct StubClientEngine {
    identity: Vec<u8>,
    hello_sent: bool,
    accepted: bool,
    input: Vec<u8>,
    output: Vec<u8>,
}

impl StubClientEngine {
    pub fn new(identity: Vec<u8>) -> Self {
        Self {
            identity,
            hello_sent: false,
            accepted: false,
            input: Vec::new(),
            output: Vec::new(),
        }
    }
}

impl HandshakeEngine for StubClientEngine {
    fn offer_input(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut data = data;
        if !self.accepted {
            match data.first() {
                Some(&ACCEPT) => {
                    self.accepted = true;
                    data = &data[1..];
                }
                Some(_) => {
                    return Err(TransportError::Handshake(
                        "unexpected handshake reply".into(),
                    ));
                }
                None => return Ok(()),
            }
        }
        self.input.extend_from_slice(data);
        Ok(())
    }

    fn take_input(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(std::mem::take(&mut self.input))
    }

    fn offer_output(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn take_output(&mut self) -> Result<Vec<u8>, TransportError> {
        if !self.hello_sent {
            self.hello_sent = true;
            let mut hello = vec![HELLO, self.identity.len() as u8];
            hello.extend_from_slice(&self.identity);
            hello.extend_from_slice(&self.output);
            self.output.clear();
            return Ok(hello);
        }
        Ok(std::mem::take(&mut self.output))
    }

    fn is_handshaking(&self) -> bool {
        !self.accepted
    }

    fn peer_credential(&self) -> Option<PeerCredential> {
        None
    }
}

/// Server side of the scripted handshake.
pub struct StubServerEngine {
    psks: Arc<dyn PskStore>,
    hello: Vec<u8>,
    identity: Option<Vec<u8>>,
    input: Vec<u8>,
    output: Vec<u8>,
}

impl StubServerEngine {
    pub fn new(psks: Arc<dyn PskStore>) -> Self {
        Self {
            psks,
            hello: Vec::new(),
            identity: None,
            input: Vec::new(),
            output: Vec::new(),
        }
    }
}

impl HandshakeEngine for StubServerEngine {
    fn offer_input(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.identity.is_some() {
            self.input.extend_from_slice(data);
            return Ok(());
        }

        self.hello.extend_from_slice(data);
        if self.hello.len() < 2 {
            return Ok(());
        }
        if self.hello[0] != HELLO {
            return Err(TransportError::Handshake("malformed client hello".into()));
        }
        let id_len = self.hello[1] as usize;
        if self.hello.len() < 2 + id_len {
            return Ok(());
        }

        let identity = self.hello[2..2 + id_len].to_vec();
        if self.psks.resolve(&identity).is_none() {
            return Err(TransportError::UnknownPskIdentity { identity });
        }

        // Anything trailing the hello is already application data.
        self.input.extend_from_slice(&self.hello[2 + id_len..]);
        self.hello.clear();
        self.identity = Some(identity);
        self.output.push(ACCEPT);
        Ok(())
    }

    fn take_input(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(std::mem::take(&mut self.input))
    }

    fn offer_output(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn take_output(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(std::mem::take(&mut self.output))
    }

    fn is_handshaking(&self) -> bool {
        self.identity.is_none()
    }

    fn peer_credential(&self) -> Option<PeerCredential> {
        self.identity.clone().map(PeerCredential::PskIdentity)
    }
}

/// Factory producing the scripted engines; carries the server's key store.
pub struct StubEngineFactory {
    pub psks: Arc<dyn PskStore>,
}

impl EngineFactory for StubEngineFactory {
    fn client(
        &self,
        _peer: SocketAddr,
        security: &ClientSecurity,
        _config: &HandshakeConfig,
    ) -> Result<Box<dyn HandshakeEngine>, TransportError> {
        match &security.credential {
            ClientCredential::Psk { identity, .. } => {
                Ok(Box::new(StubClientEngine::new(identity.clone())))
            }
            ClientCredential::Certificate { .. } => Err(TransportError::Configuration(
                "scripted engine only supports symmetric-key credentials".into(),
            )),
        }
    }

    fn server(
        &self,
        _security: &ServerSecurity,
        _config: &HandshakeConfig,
    ) -> Result<Box<dyn HandshakeEngine>, TransportError> {
        Ok(Box::new(StubServerEngine::new(Arc::clone(&self.psks))))
    }
}

/// Await the channel's next event, failing the test on timeout.
pub async fn next_event_timeout(channel: &Channel, wait: Duration) -> Option<TransportEvent> {
    tokio::time::timeout(wait, channel.next_event())
        .await
        .ok()
        .flatten()
}
