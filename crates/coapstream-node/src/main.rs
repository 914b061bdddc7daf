use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use coapstream_node::config::TcpListenerEntry;
use coapstream_node::{Node, NodeConfig};

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "coapstream-node", about = "CoAP-over-TCP/TLS transport node")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/coapstream/config.toml")]
    config: PathBuf,
    /// Add a plaintext listener on this address, in addition to the config
    #[arg(short, long)]
    listen: Option<std::net::SocketAddr>,
    /// Echo received application frames back to their sender
    #[arg(long)]
    echo: bool,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = if cli.config.exists() {
        match NodeConfig::load(&cli.config) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("failed to load config from {}: {e}", cli.config.display());
                std::process::exit(1);
            }
        }
    } else {
        NodeConfig::default()
    };

    // Initialize logging with the configured default level
    match cli.log_format {
        LogFormat::Json => coapstream_node::logging::init_json(&config.logging.level),
        LogFormat::Text => coapstream_node::logging::init(&config.logging.level),
    }

    if let Some(addr) = cli.listen {
        config.listeners.tcp.push(TcpListenerEntry {
            name: "cli".to_string(),
            bind: addr.to_string(),
        });
    }
    if cli.echo {
        config.node.echo = true;
    }

    let mut node = Node::new(config);
    let handle = node.shutdown_handle();

    // Spawn signal handler
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received SIGINT, shutting down");
        handle.shutdown();
    });

    if let Err(e) = node.start().await {
        tracing::error!("failed to start node: {e}");
        std::process::exit(1);
    }

    node.run().await;
    node.shutdown().await;
}
