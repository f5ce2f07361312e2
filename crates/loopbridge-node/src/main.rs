//! loopbridge -- tunnel a game's ENet traffic over peer-to-peer streams.
//!
//! Usage:
//!   loopbridge                      # Run with default config
//!   loopbridge --config path.toml   # Run with custom config
//!   loopbridge identity             # Show node identity
//!   loopbridge config               # Print the effective config

use loopbridge_node::clock::SyncClock;
use loopbridge_node::config::{self, NodeConfig};
use loopbridge_node::net::swarm;
use loopbridge_node::net::SwarmNetwork;
use loopbridge_node::proxy::{self, ProxyEvent, TunnelProxy};
use loopbridge_node::scheduler::Scheduler;
use loopbridge_node::transport::{DialPolicy, StreamTransport};
use loopbridge_node::{expand_tilde, leg_factory, parse_listen_addr};

use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use loopbridge_crypto::NodeIdentity;
use libp2p::PeerId;

#[derive(Parser)]
#[command(name = "loopbridge", about = "ENet game tunnel over peer-to-peer streams")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.loopbridge/config.toml")]
    config: String,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or generate node identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Run the node (default)
    Run,
    /// Print the effective configuration
    Config,
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity keypair
    Generate,
    /// Show current node identity
    Show,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "loopbridge_node=info,loopbridge_enet=warn".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = config::NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Identity { action }) => {
            let key_path = expand_tilde(&cfg.node.identity_key);
            match action {
                Some(IdentityAction::Generate) | None => {
                    let identity = NodeIdentity::load_or_create(&key_path)?;
                    println!("Peer ID: {}", identity.peer_id());
                    println!("Key file: {}", key_path.display());
                }
                Some(IdentityAction::Show) => {
                    if key_path.exists() {
                        let identity = NodeIdentity::from_file(&key_path)?;
                        println!("Peer ID: {}", identity.peer_id());
                    } else {
                        eprintln!("No identity found at {}", key_path.display());
                        std::process::exit(1);
                    }
                }
            }
        }
        Some(Commands::Config) => {
            print!("{}", cfg.to_toml()?);
        }
        Some(Commands::Run) | None => {
            run_node(cfg).await?;
        }
    }

    Ok(())
}

async fn run_node(cfg: NodeConfig) -> anyhow::Result<()> {
    let key_path = expand_tilde(&cfg.node.identity_key);
    let identity = NodeIdentity::load_or_create(&key_path)?;
    let our_peer_id = *identity.peer_id();
    let our_role = cfg.role();

    tracing::info!(
        peer_id = %our_peer_id,
        version = env!("CARGO_PKG_VERSION"),
        role = our_role.as_str(),
        "starting loopbridge"
    );
    tracing::info!(
        listen = %cfg.network.listen_addr,
        peers = cfg.network.peers.len(),
        accepts_streams = our_role.listens(),
        delay_ms = cfg.proxy.delay_ms,
        "network config"
    );

    // Shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Build libp2p swarm
    let listen_addr = parse_listen_addr(&cfg.network.listen_addr)?;
    let swarm = swarm::build_swarm(identity.keypair(), listen_addr)
        .map_err(|e| anyhow::anyhow!("swarm build failed: {e}"))?;

    let (cmd_tx, cmd_rx) = tokio::sync::mpsc::channel::<swarm::SwarmCommand>(256);
    let network = SwarmNetwork::new(&swarm, cmd_tx);

    let swarm_handle = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            swarm::run_swarm_loop(swarm, cmd_rx, shutdown).await;
        })
    };

    // Seed known peer addresses
    for entry in &cfg.network.peers {
        let peer: PeerId = match entry.peer_id.parse() {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(peer_id = %entry.peer_id, "net: bad peer id in config: {e}");
                continue;
            }
        };
        match parse_listen_addr(&entry.addr) {
            Ok(addr) => network.dial(peer, addr).await,
            Err(e) => tracing::warn!(%peer, addr = %entry.addr, "net: bad peer address: {e}"),
        }
    }

    let transport = StreamTransport::new(Arc::new(network), DialPolicy::TieBreak);
    let scheduler = Scheduler::new(
        SyncClock::new(),
        Duration::from_millis(cfg.proxy.tick_ms.max(1)),
    );
    let legs = leg_factory(&cfg)?;
    let proxies = proxy::build(&cfg, &transport, legs, &scheduler)?;

    // Log proxy events until each proxy stops
    let event_handles: Vec<_> = proxies
        .iter()
        .map(|proxy| {
            let mut events = proxy.subscribe();
            let role = proxy.role().as_str();
            tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(ProxyEvent::RouteFailed { peer, reason }) => {
                            tracing::warn!(role, %peer, %reason, "proxy: route failed");
                        }
                        Ok(ProxyEvent::Stopped) => break,
                        Ok(event) => tracing::info!(role, ?event, "proxy: event"),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::debug!(role, skipped, "proxy: event log lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            })
        })
        .collect();

    for proxy in &proxies {
        if let Err(e) = proxy.start().await {
            for proxy in &proxies {
                proxy.stop().await;
            }
            let _ = shutdown_tx.send(());
            return Err(e.into());
        }
    }
    tracing::info!(role = our_role.as_str(), proxies = proxies.len(), "loopbridge running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    for proxy in &proxies {
        proxy.stop().await;
    }
    transport.shutdown().await;
    let _ = shutdown_tx.send(());
    let _ = swarm_handle.await;
    for handle in event_handles {
        let _ = handle.await;
    }

    Ok(())
}
