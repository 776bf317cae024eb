//! PeerLink CLI - run a peer-to-peer node from the command line.

use clap::{Parser, Subcommand};
use peerlink_core::node::{CloseDetails, Connection, NodeListener, NodesById};
use peerlink_core::{Address, ApplicationMessage, NodeState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

/// PeerLink - transport-agnostic peer-to-peer node
#[derive(Parser)]
#[command(name = "peerlink")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Run {
        /// Listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Transport to listen and dial on (clear, tor, i2p)
        #[arg(short, long)]
        transport: Option<String>,

        /// Node identity (overrides config)
        #[arg(long)]
        node_id: Option<String>,

        /// Peer to connect to after startup (host:port)
        #[arg(long)]
        connect: Option<String>,

        /// Text message sent to the peer given by --connect
        #[arg(short, long, requires = "connect")]
        message: Option<String>,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;

    // Initialize logging; RUST_LOG wins over flags and config
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            port,
            transport,
            node_id,
            connect,
            message,
        } => {
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(transport) = transport {
                config.network.transport = transport;
            }
            if let Some(node_id) = node_id {
                config.node.id = node_id;
            }
            config.validate()?;
            run_node(config, connect, message).await
        }
        Commands::Config => {
            config.validate()?;
            println!("# {}", config_path.display());
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Logs node events
struct LoggingListener;

impl NodeListener for LoggingListener {
    fn on_message(&self, message: &ApplicationMessage, connection: &Connection) {
        match std::str::from_utf8(&message.payload) {
            Ok(text) => info!("[{}] {} from {}: {}", connection.id(), message.kind, connection.peer_address(), text),
            Err(_) => info!(
                "[{}] {} from {}: {} bytes",
                connection.id(),
                message.kind,
                connection.peer_address(),
                message.payload.len()
            ),
        }
    }

    fn on_connection(&self, connection: &Connection) {
        info!("Connected: {} ({})", connection.peer_capability(), connection.direction());
    }

    fn on_disconnect(&self, connection: &Connection, details: &CloseDetails) {
        info!("Disconnected: {} ({})", connection.peer_address(), details);
    }

    fn on_state_change(&self, state: NodeState) {
        info!("Node state: {}", state);
    }
}

async fn run_node(
    config: Config,
    connect: Option<String>,
    message: Option<String>,
) -> anyhow::Result<()> {
    let registry = NodesById::with_ban_list(config.to_node_config()?, config.ban_list()?);
    let node = registry.get_or_create_node(&config.node.id);
    node.add_listener(Arc::new(LoggingListener));

    info!(
        "Starting node {} on {} transport",
        config.node.id, config.network.transport
    );
    if let Err(e) = node.initialize(config.node.port).await {
        error!("Node failed to start: {}", e);
        registry.shutdown().await;
        return Err(e.into());
    }

    match node.find_my_address() {
        Some(address) => info!("Listening on {}", address),
        None => warn!("Node is running without a known address"),
    }

    if let Some(peer) = connect {
        let address: Address = peer.parse()?;
        let result = match message {
            Some(text) => node
                .send(ApplicationMessage::new("text", text.into_bytes()), &address)
                .await
                .map(|_| ()),
            None => node.get_connection(&address).await.map(|_| ()),
        };
        if let Err(e) = result {
            warn!("Could not reach {}: {}", address, e);
        }
    }

    info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    if !registry.shutdown().await {
        warn!("Shutdown did not complete cleanly");
    }
    Ok(())
}
