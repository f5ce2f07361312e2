//! Swarm task -- owns the libp2p Swarm; tunnel streams are handed out
//! through a `libp2p-stream` control handle.
//!
//! The swarm itself only keeps connections alive (ping), learns listen
//! addresses (identify) and dials configured peers on request.

use async_trait::async_trait;
use futures_util::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::SwarmEvent;
use libp2p::{identity, Multiaddr, PeerId, StreamProtocol, Swarm};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::compat::FuturesAsyncReadCompatExt;

use loopbridge_protocol::{IDENTIFY_PROTOCOL, TUNNEL_PROTOCOL};

use super::{IncomingStreams, P2pNetwork, TunnelStream};
use crate::transport::TransportError;

const ACCEPT_QUEUE: usize = 32;

// ============================================================================
// Behaviour definition
// ============================================================================

#[derive(libp2p::swarm::NetworkBehaviour)]
pub struct TunnelBehaviour {
    pub ping: libp2p::ping::Behaviour,
    pub identify: libp2p::identify::Behaviour,
    pub stream: libp2p_stream::Behaviour,
}

// ============================================================================
// Commands (inbound to swarm task)
// ============================================================================

pub enum SwarmCommand {
    /// Remember `addr` for `peer` and dial it.
    Dial { peer: PeerId, addr: Multiaddr },
}

// ============================================================================
// Build swarm
// ============================================================================

pub fn build_swarm(
    keypair: identity::Keypair,
    listen_addr: Multiaddr,
) -> Result<Swarm<TunnelBehaviour>, Box<dyn std::error::Error + Send + Sync>> {
    let peer_id = PeerId::from(keypair.public());

    let behaviour = TunnelBehaviour {
        ping: libp2p::ping::Behaviour::new(
            libp2p::ping::Config::new().with_interval(Duration::from_secs(15)),
        ),
        identify: libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
            IDENTIFY_PROTOCOL.into(),
            keypair.public(),
        )),
        stream: libp2p_stream::Behaviour::new(),
    };

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            libp2p::tcp::Config::default().nodelay(true),
            libp2p::noise::Config::new,
            libp2p::yamux::Config::default,
        )?
        .with_dns()?
        .with_behaviour(|_| behaviour)?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(120)))
        .build();

    swarm.listen_on(listen_addr)?;

    tracing::info!(%peer_id, "swarm built");
    Ok(swarm)
}

// ============================================================================
// Run loop
// ============================================================================

pub async fn run_swarm_loop(
    mut swarm: Swarm<TunnelBehaviour>,
    mut cmd_rx: mpsc::Receiver<SwarmCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    SwarmCommand::Dial { peer, addr } => {
                        tracing::debug!(%peer, %addr, "net: dialling");
                        swarm.add_peer_address(peer, addr.clone());
                        let opts = DialOpts::peer_id(peer).addresses(vec![addr.clone()]).build();
                        if let Err(e) = swarm.dial(opts) {
                            tracing::warn!(%peer, %addr, "net: dial failed: {e}");
                        }
                    }
                }
            }

            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        tracing::info!(%address, "listening");
                    }
                    SwarmEvent::ConnectionEstablished {
                        peer_id,
                        endpoint,
                        num_established,
                        ..
                    } => {
                        let addr = endpoint.get_remote_address().clone();
                        let direction = if endpoint.is_dialer() { "outbound" } else { "inbound" };
                        tracing::info!(
                            %peer_id,
                            %addr,
                            direction,
                            connections = num_established.get(),
                            "net: connection established"
                        );
                    }
                    SwarmEvent::ConnectionClosed {
                        peer_id,
                        num_established,
                        cause,
                        ..
                    } => {
                        tracing::info!(
                            %peer_id,
                            remaining = num_established,
                            cause = cause.as_ref().map(|c| format!("{c}")).as_deref().unwrap_or("clean"),
                            "net: connection closed"
                        );
                    }
                    SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                        tracing::warn!(peer = ?peer_id, "net: outgoing connection failed: {error}");
                    }
                    SwarmEvent::Behaviour(TunnelBehaviourEvent::Identify(
                        libp2p::identify::Event::Received { peer_id, info, .. },
                    )) => {
                        tracing::debug!(
                            %peer_id,
                            agent = %info.agent_version,
                            listen_addrs = info.listen_addrs.len(),
                            "net: identify received"
                        );
                        for addr in info.listen_addrs {
                            swarm.add_peer_address(peer_id, addr);
                        }
                    }
                    SwarmEvent::Behaviour(TunnelBehaviourEvent::Ping(ping)) => {
                        if let Ok(rtt) = ping.result {
                            tracing::trace!(peer_id = %ping.peer, rtt_ms = rtt.as_millis() as u64, "net: ping");
                        }
                    }
                    _ => {}
                }
            }

            _ = shutdown.recv() => {
                tracing::info!("net: swarm shutting down");
                break;
            }
        }
    }
}

// ============================================================================
// P2pNetwork over the swarm
// ============================================================================

/// Handle to a running swarm task.
#[derive(Clone)]
pub struct SwarmNetwork {
    peer_id: PeerId,
    control: libp2p_stream::Control,
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmNetwork {
    /// Take the stream control from `swarm` before it is moved into
    /// [`run_swarm_loop`].
    pub fn new(swarm: &Swarm<TunnelBehaviour>, cmd_tx: mpsc::Sender<SwarmCommand>) -> Self {
        Self {
            peer_id: *swarm.local_peer_id(),
            control: swarm.behaviour().stream.new_control(),
            cmd_tx,
        }
    }

    pub async fn dial(&self, peer: PeerId, addr: Multiaddr) {
        if self.cmd_tx.send(SwarmCommand::Dial { peer, addr }).await.is_err() {
            tracing::warn!(%peer, "net: swarm task gone, dial dropped");
        }
    }
}

#[async_trait]
impl P2pNetwork for SwarmNetwork {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn open_stream(&self, peer: PeerId) -> Result<TunnelStream, TransportError> {
        let mut control = self.control.clone();
        let stream = control
            .open_stream(peer, StreamProtocol::new(TUNNEL_PROTOCOL))
            .await
            .map_err(|e| TransportError::Dial {
                peer,
                reason: e.to_string(),
            })?;
        tracing::debug!(%peer, "net: tunnel stream opened");
        Ok(Box::new(stream.compat()))
    }

    async fn accept_streams(&self) -> Result<IncomingStreams, TransportError> {
        let mut control = self.control.clone();
        let mut incoming = control
            .accept(StreamProtocol::new(TUNNEL_PROTOCOL))
            .map_err(|_| TransportError::AlreadyListening)?;

        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                tracing::debug!(%peer, "net: tunnel stream accepted");
                if tx.send((peer, Box::new(stream.compat()) as TunnelStream)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
