//! Key material and credential resolution for secure channels.
//!
//! The transport never interprets key material beyond dispatching on its
//! kind: a symmetric identity/secret pair selects the PSK handshake path, a
//! certificate chain plus private key the certificate path. PSK identities
//! claimed by connecting clients are resolved through the [`PskStore`]
//! callback during the server-side handshake.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::lock;

/// Resolves a claimed PSK identity to its secret during a server handshake.
///
/// Returning `None` signals "unknown identity"; the handshake engine turns
/// that into a handshake failure visible to the peer, and the channel emits
/// a security event so the layer above can supply the key out of band.
pub trait PskStore: Send + Sync {
    fn resolve(&self, identity: &[u8]) -> Option<Vec<u8>>;
}

/// A mutable in-memory identity table.
pub struct InMemoryPskStore {
    keys: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryPskStore {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, identity: impl Into<Vec<u8>>, secret: impl Into<Vec<u8>>) {
        lock(&self.keys).insert(identity.into(), secret.into());
    }

    pub fn remove(&self, identity: &[u8]) {
        lock(&self.keys).remove(identity);
    }
}

impl Default for InMemoryPskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PskStore for InMemoryPskStore {
    fn resolve(&self, identity: &[u8]) -> Option<Vec<u8>> {
        lock(&self.keys).get(identity).cloned()
    }
}

/// The credential a client presents when originating a secure connection.
pub enum ClientCredential {
    /// Symmetric pre-shared key: identity bytes plus the shared secret.
    Psk { identity: Vec<u8>, secret: Vec<u8> },
    /// Certificate chain (end-entity first) and its private key.
    Certificate {
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    },
}

/// Everything a client-side secure session needs: the credential, the trust
/// roots used to validate the server, and an optional server-name override
/// (the peer's IP address is used when absent).
pub struct ClientSecurity {
    pub credential: ClientCredential,
    pub roots: RootCertStore,
    pub server_name: Option<String>,
}

impl ClientSecurity {
    pub fn psk(identity: impl Into<Vec<u8>>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            credential: ClientCredential::Psk {
                identity: identity.into(),
                secret: secret.into(),
            },
            roots: RootCertStore::empty(),
            server_name: None,
        }
    }

    pub fn certificate(
        chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
        roots: RootCertStore,
    ) -> Self {
        Self {
            credential: ClientCredential::Certificate { chain, key },
            roots,
            server_name: None,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Everything a server-side secure session needs: the signing certificate and
/// key, the PSK identity table for symmetric clients, and optional trust
/// roots that switch on client-certificate authentication.
pub struct ServerSecurity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub psks: Arc<dyn PskStore>,
    pub client_auth_roots: Option<RootCertStore>,
}

impl ServerSecurity {
    pub fn new(cert_chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self {
            cert_chain,
            key,
            psks: Arc::new(InMemoryPskStore::new()),
            client_auth_roots: None,
        }
    }

    pub fn with_psk_store(mut self, psks: Arc<dyn PskStore>) -> Self {
        self.psks = psks;
        self
    }

    pub fn with_client_auth(mut self, roots: RootCertStore) -> Self {
        self.client_auth_roots = Some(roots);
        self
    }
}
