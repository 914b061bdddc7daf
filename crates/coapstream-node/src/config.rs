//! TOML-based configuration for transport nodes.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::NodeError;

/// Top-level node configuration loaded from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub listeners: ListenersSection,
    #[serde(default)]
    pub psk: Vec<PskEntry>,
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, NodeError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NodeError::Config(format!("failed to read config file: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, NodeError> {
        toml::from_str(s).map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))
    }
}

/// The `[node]` section.
#[derive(Debug, Deserialize)]
pub struct NodeSection {
    /// Echo every received application frame back to its sender.
    #[serde(default)]
    pub echo: bool,
    /// Maximum message size advertised in the capability signal. Default: 1152.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
}

fn default_max_message_size() -> u32 {
    coapstream_core::constants::DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            echo: false,
            max_message_size: default_max_message_size(),
        }
    }
}

/// The `[logging]` section.
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// The `[listeners]` section containing arrays of listener configs.
#[derive(Debug, Default, Deserialize)]
pub struct ListenersSection {
    #[serde(default)]
    pub tcp: Vec<TcpListenerEntry>,
    #[serde(default)]
    pub tls: Vec<TlsListenerEntry>,
}

/// A `[[listeners.tcp]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TcpListenerEntry {
    pub name: String,
    pub bind: String,
}

/// A `[[listeners.tls]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsListenerEntry {
    pub name: String,
    pub bind: String,
    /// PEM certificate chain, end-entity first.
    pub cert: String,
    /// PEM private key.
    pub key: String,
}

/// A `[[psk]]` entry provisioning one symmetric key on the TLS listeners.
#[derive(Debug, Clone, Deserialize)]
pub struct PskEntry {
    pub identity: String,
    /// Hex-encoded shared secret.
    pub secret_hex: String,
}

impl PskEntry {
    pub fn secret(&self) -> Result<Vec<u8>, NodeError> {
        hex::decode(&self.secret_hex).map_err(|e| {
            NodeError::Config(format!(
                "invalid secret_hex for identity '{}': {e}",
                self.identity
            ))
        })
    }
}

/// Parse a socket address string.
pub fn parse_socket_addr(s: &str) -> Result<SocketAddr, NodeError> {
    s.parse()
        .map_err(|e| NodeError::Config(format!("invalid socket address '{s}': {e}")))
}
