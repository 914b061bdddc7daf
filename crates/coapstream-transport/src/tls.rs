//! TLS handshake engine backed by rustls.
//!
//! rustls is driven sans-I/O: the session's loops own the socket, and this
//! module only moves bytes between the connection object and the engine
//! buffers. Certificate credentials map directly onto rustls configs; the
//! symmetric-key credential has no rustls counterpart, so constructing a TLS
//! engine for it is a configuration error and callers wanting PSK plug in a
//! different [`EngineFactory`].

use std::io::{self, BufReader, Read, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use crate::error::TransportError;
use crate::handshake::{
    EngineFactory, HandshakeConfig, HandshakeEngine, PeerCredential, TlsVersion,
};
use crate::keys::{ClientCredential, ClientSecurity, ServerSecurity};

fn protocol_versions(
    config: &HandshakeConfig,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>, TransportError> {
    if config.min_version > config.max_version {
        return Err(TransportError::Configuration(format!(
            "min TLS version {:?} exceeds max {:?}",
            config.min_version, config.max_version
        )));
    }
    let mut versions = Vec::new();
    if config.min_version <= TlsVersion::V1_2 && config.max_version >= TlsVersion::V1_2 {
        versions.push(&rustls::version::TLS12);
    }
    if config.max_version >= TlsVersion::V1_3 {
        versions.push(&rustls::version::TLS13);
    }
    Ok(versions)
}

/// [`HandshakeEngine`] wrapping a rustls client or server connection.
pub struct TlsEngine {
    conn: Connection,
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}

impl TlsEngine {
    /// Build the client-side engine for a connection to `peer`.
    pub fn client(
        peer: SocketAddr,
        security: &ClientSecurity,
        config: &HandshakeConfig,
    ) -> Result<Self, TransportError> {
        let versions = protocol_versions(config)?;
        let builder = ClientConfig::builder_with_protocol_versions(&versions)
            .with_root_certificates(security.roots.clone());

        let tls_config = match &security.credential {
            ClientCredential::Certificate { chain, key } => {
                builder.with_client_auth_cert(chain.clone(), key.clone_key())?
            }
            ClientCredential::Psk { .. } => {
                return Err(TransportError::Configuration(
                    "symmetric-key credentials need a PSK-capable handshake engine".into(),
                ));
            }
        };

        let server_name = match &security.server_name {
            Some(name) => ServerName::try_from(name.clone()).map_err(|_| {
                TransportError::Configuration(format!("invalid server name {name:?}"))
            })?,
            None => ServerName::from(peer.ip()),
        };

        let conn = ClientConnection::new(Arc::new(tls_config), server_name)?;
        Ok(Self {
            conn: Connection::Client(conn),
        })
    }

    /// Build the server-side engine for an accepted connection.
    pub fn server(
        security: &ServerSecurity,
        config: &HandshakeConfig,
    ) -> Result<Self, TransportError> {
        let versions = protocol_versions(config)?;
        let builder = ServerConfig::builder_with_protocol_versions(&versions);

        let builder = match &security.client_auth_roots {
            Some(roots) => {
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots.clone()))
                    .build()
                    .map_err(|e| {
                        TransportError::Configuration(format!(
                            "client-certificate verifier: {e}"
                        ))
                    })?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let tls_config =
            builder.with_single_cert(security.cert_chain.clone(), security.key.clone_key())?;
        let conn = ServerConnection::new(Arc::new(tls_config))?;
        Ok(Self {
            conn: Connection::Server(conn),
        })
    }
}

impl HandshakeEngine for TlsEngine {
    fn offer_input(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let mut cursor = data;
        while !cursor.is_empty() {
            self.conn.read_tls(&mut cursor)?;
            self.conn.process_new_packets()?;
        }
        Ok(())
    }

    fn take_input(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut plaintext = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // Peer closed without close_notify; whatever decrypted so far
                // still counts.
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(plaintext)
    }

    fn offer_output(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.conn.writer().write_all(data)?;
        Ok(())
    }

    fn take_output(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut sealed = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut sealed)?;
        }
        Ok(sealed)
    }

    fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    fn peer_credential(&self) -> Option<PeerCredential> {
        self.conn
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| PeerCredential::Certificate(cert.as_ref().to_vec()))
    }
}

/// The default [`EngineFactory`], producing [`TlsEngine`]s.
pub struct TlsEngineFactory;

impl EngineFactory for TlsEngineFactory {
    fn client(
        &self,
        peer: SocketAddr,
        security: &ClientSecurity,
        config: &HandshakeConfig,
    ) -> Result<Box<dyn HandshakeEngine>, TransportError> {
        Ok(Box::new(TlsEngine::client(peer, security, config)?))
    }

    fn server(
        &self,
        security: &ServerSecurity,
        config: &HandshakeConfig,
    ) -> Result<Box<dyn HandshakeEngine>, TransportError> {
        Ok(Box::new(TlsEngine::server(security, config)?))
    }
}

/// Read a PEM certificate chain, end-entity first.
pub fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    let chain = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(TransportError::Configuration(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(chain)
}

/// Read a PEM private key (PKCS#8, PKCS#1, or SEC1).
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        TransportError::Configuration(format!("no private key in {}", path.display()))
    })
}
