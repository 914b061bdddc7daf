//! Node orchestration for the CoAP stream transport.
//!
//! This crate ties the transport layer to configuration, logging, and runtime
//! management for a standalone node binary.

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

pub use config::NodeConfig;
pub use error::NodeError;
pub use node::{Node, ShutdownHandle};
