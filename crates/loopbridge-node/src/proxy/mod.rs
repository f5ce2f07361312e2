//! Proxy orchestrator -- wires remote participants to loopback UDP sockets.
//!
//! Three roles share one [`ProxyBase`]: [`ServerProxy`] fronts an
//! authoritative process for remote clients, [`ClientProxy`] fronts a game
//! client for one remote server, and [`ClientServerProxy`] does both at once
//! with every participant's input fed to every node's authoritative process.
//!
//! Each route runs in its own task that exclusively owns its sockets and
//! sessions. Tasks talk to each other only through bounded channels.

pub mod client;
pub mod client_server;
pub mod server;

use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use loopbridge_enet::{SessionError, SessionPeer, WrappedPacket};

use crate::config::{NodeConfig, Role};
use crate::leg::{Ingested, LegFactory, PacketLeg, ProgramSocket, MAX_DATAGRAM};
use crate::routes::RouteTable;
use crate::scheduler::Scheduler;
use crate::transport::{
    DialPolicy, StreamTransport, TransportError, TransportSender, TransportSocket,
};

pub use client::ClientProxy;
pub use client_server::ClientServerProxy;
pub use server::ServerProxy;

const EVENT_BUFFER: usize = 64;
/// Scheduled deliveries a route may have in flight.
const DELIVERY_QUEUE: usize = 1024;
/// Packets held for a program whose session is not connected yet.
const MAX_PENDING: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    RouteEstablished { peer: PeerId },
    RouteFailed { peer: PeerId, reason: String },
    PeerDisconnected { peer: PeerId },
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("bind {addr} failed: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("session: {0}")]
    Session(#[from] SessionError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("config: {0}")]
    Config(String),
}

/// What every route task of one proxy shares.
#[derive(Clone)]
pub(crate) struct RouteContext {
    pub transport: StreamTransport,
    pub legs: Arc<dyn LegFactory>,
    pub scheduler: Scheduler,
    pub delay_ms: i64,
    pub events: broadcast::Sender<ProxyEvent>,
    pub routes: RouteTable,
}

impl RouteContext {
    pub fn now_ms(&self) -> i64 {
        self.scheduler.clock().now_ms()
    }

    pub fn emit(&self, event: ProxyEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    /// Deliver `packets` through `deliveries` at `sent_at + delay`, or now
    /// when the sender did not stamp them.
    pub fn schedule_delivery(
        &self,
        sent_at: Option<i64>,
        packets: Vec<WrappedPacket>,
        deliveries: &mpsc::Sender<Vec<WrappedPacket>>,
    ) {
        let target = match sent_at {
            Some(sent_at) => sent_at + self.delay_ms,
            None => self.now_ms(),
        };
        let deliveries = deliveries.clone();
        self.scheduler.enqueue(target, move || {
            if deliveries.try_send(packets).is_err() {
                tracing::warn!("route: delivery queue full, packets dropped");
            }
        });
    }

    pub async fn established(&self, peer: PeerId, sender: TransportSender) {
        self.routes.mark_established(&peer, sender).await;
        self.emit(ProxyEvent::RouteEstablished { peer });
    }

    pub async fn failed(&self, peer: PeerId, id: u64, error: &ProxyError) {
        self.routes.remove_if_current(&peer, id).await;
        if matches!(error, ProxyError::Transport(TransportError::Aborted)) {
            tracing::debug!(%peer, "route: setup aborted");
            return;
        }
        tracing::warn!(%peer, "route: setup failed: {error}");
        self.emit(ProxyEvent::RouteFailed {
            peer,
            reason: error.to_string(),
        });
    }

    /// Open both ends of a route whose program is the authoritative process
    /// at `game_server`: the loopback socket, the channel to `peer`, then the
    /// ENet connect. Whatever was opened is closed again on failure.
    pub async fn open_program_route(
        &self,
        peer: PeerId,
        leg: Box<dyn PacketLeg>,
        game_server: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(ProgramLink, TransportSocket), ProxyError> {
        let socket = ProgramSocket::connect(game_server).await?;
        let remote = self.transport.create_socket_to_remote(peer, cancel).await?;
        let mut link = ProgramLink::new(socket, leg);
        if let Err(e) = link.connect().await {
            remote.close();
            return Err(e.into());
        }
        Ok((link, remote))
    }
}

/// A leg together with the socket its program talks through.
pub(crate) struct ProgramLink {
    socket: ProgramSocket,
    leg: Box<dyn PacketLeg>,
    buf: Vec<u8>,
    pending: Vec<WrappedPacket>,
}

impl ProgramLink {
    pub fn new(socket: ProgramSocket, leg: Box<dyn PacketLeg>) -> Self {
        Self {
            socket,
            leg,
            buf: vec![0; MAX_DATAGRAM],
            pending: Vec::new(),
        }
    }

    pub fn session(&self) -> &SessionPeer {
        self.leg.session()
    }

    /// Wait for the next datagram; returns its length. Cancel safe.
    pub async fn recv(&mut self) -> io::Result<usize> {
        self.socket.recv(&mut self.buf).await
    }

    /// The datagram last returned by [`recv`](Self::recv).
    pub fn datagram(&self, len: usize) -> &[u8] {
        &self.buf[..len]
    }

    /// Run the last datagram through the leg, answer the program, and flush
    /// held deliveries if this completed the handshake.
    pub async fn ingest(&mut self, len: usize) -> Ingested {
        let was_connected = self.leg.session().is_connected();
        let mut ingested = self.leg.ingest(&self.buf[..len]);
        for reply in std::mem::take(&mut ingested.replies) {
            self.socket.send(&reply).await;
        }
        if !was_connected && self.leg.session().is_connected() && !self.pending.is_empty() {
            let held = std::mem::take(&mut self.pending);
            tracing::debug!(packets = held.len(), "route: flushing held deliveries");
            self.deliver(held).await;
        }
        ingested
    }

    /// Hand relayed packets to the program, or hold them until its session
    /// is connected.
    pub async fn deliver(&mut self, packets: Vec<WrappedPacket>) {
        if !self.leg.session().is_connected() {
            self.pending.extend(packets);
            if self.pending.len() > MAX_PENDING {
                let excess = self.pending.len() - MAX_PENDING;
                self.pending.drain(..excess);
                tracing::warn!(dropped = excess, "route: program not connected, oldest packets dropped");
            }
            return;
        }
        if let Some(datagram) = self.leg.deliver(packets) {
            self.socket.send(&datagram).await;
        }
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        let datagram = self.leg.connect()?;
        self.socket.send(&datagram).await;
        Ok(())
    }

    pub async fn connect_as(&mut self, session_id: u32, outgoing_peer_id: u16) -> Result<(), SessionError> {
        let datagram = self.leg.connect_as(session_id, outgoing_peer_id)?;
        self.socket.send(&datagram).await;
        Ok(())
    }

    /// Send bytes to the program untouched.
    pub async fn send_raw(&mut self, datagram: &[u8]) {
        self.socket.send(datagram).await;
    }

    /// Swap in a fresh leg, telling the program the old connection is gone.
    pub async fn reset(&mut self, leg: Box<dyn PacketLeg>) {
        self.close().await;
        self.leg = leg;
        self.pending.clear();
    }

    /// Tell the program its connection is over.
    pub async fn close(&mut self) {
        if let Some(datagram) = self.leg.disconnect() {
            self.socket.send(&datagram).await;
        }
    }
}

/// State and lifecycle shared by every role.
pub struct ProxyBase {
    ctx: RouteContext,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyBase {
    pub fn new(
        transport: StreamTransport,
        legs: Arc<dyn LegFactory>,
        scheduler: Scheduler,
        delay_ms: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            ctx: RouteContext {
                transport,
                legs,
                scheduler,
                delay_ms: delay_ms as i64,
                events,
                routes: RouteTable::new(),
            },
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.ctx.routes
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.ctx.events.subscribe()
    }

    /// `true` for the one call that gets to start the proxy.
    fn begin_start(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !self.started.swap(true, Ordering::SeqCst)
    }

    /// Let a failed start be retried.
    fn abort_start(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    async fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.push(tokio::spawn(task));
    }

    /// Cancel every route and wait for each to tear down. Safe to call in
    /// any state, any number of times.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let cancelled = self.ctx.routes.cancel_all().await;

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("proxy: route task ended abnormally: {e}");
            }
        }
        tracing::info!(routes = cancelled, "proxy: stopped");
        self.ctx.emit(ProxyEvent::Stopped);
    }

    /// Tear down one participant's route. Returns whether it existed.
    pub async fn disconnect(&self, peer: &PeerId) -> bool {
        match self.ctx.routes.remove(peer).await {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(%peer, "proxy: route disconnected");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
pub trait TunnelProxy: Send + Sync {
    fn base(&self) -> &ProxyBase;

    fn role(&self) -> Role;

    /// Bring up every route. A second call while started does nothing.
    async fn start(&self) -> Result<(), ProxyError>;

    async fn stop(&self) {
        self.base().stop().await
    }

    async fn disconnect(&self, peer: &PeerId) -> bool {
        self.base().disconnect(peer).await
    }

    fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.base().subscribe()
    }
}

pub fn parse_peer_id(text: &str) -> Result<PeerId, ProxyError> {
    PeerId::from_str(text.trim()).map_err(|e| ProxyError::Config(format!("bad peer id {text:?}: {e}")))
}

pub fn parse_socket_addr(text: &str) -> Result<SocketAddr, ProxyError> {
    text.trim()
        .parse()
        .map_err(|e| ProxyError::Config(format!("bad socket address {text:?}: {e}")))
}

/// Build the proxies `cfg` asks for on top of one shared transport: the
/// role's own proxy, plus a client attached to the local server when
/// `proxy.local_client` is set.
pub fn build(
    cfg: &NodeConfig,
    transport: &StreamTransport,
    legs: Arc<dyn LegFactory>,
    scheduler: &Scheduler,
) -> Result<Vec<Box<dyn TunnelProxy>>, ProxyError> {
    let local = transport.local_peer_id();
    let delay_ms = cfg.proxy.delay_ms;
    let mut participants = cfg
        .proxy
        .participants
        .iter()
        .map(|p| parse_peer_id(p))
        .collect::<Result<Vec<_>, _>>()?;

    let mut proxies: Vec<Box<dyn TunnelProxy>> = Vec::new();
    match cfg.role() {
        Role::Server => {
            let game_server = parse_socket_addr(&cfg.proxy.game_server_addr)?;
            if cfg.proxy.local_client && !participants.contains(&local) {
                participants.push(local);
            }
            proxies.push(Box::new(ServerProxy::new(
                ProxyBase::new(
                    transport.with_policy(DialPolicy::ListenOnly),
                    legs.clone(),
                    scheduler.clone(),
                    delay_ms,
                ),
                game_server,
                participants,
            )));
            if cfg.proxy.local_client {
                let listen = parse_socket_addr(&cfg.proxy.client_listen_addr)?;
                proxies.push(Box::new(ClientProxy::new(
                    ProxyBase::new(
                        transport.with_policy(DialPolicy::DialOnly),
                        legs,
                        scheduler.clone(),
                        delay_ms,
                    ),
                    local,
                    listen,
                )));
            }
        }
        Role::Client => {
            let server_peer = cfg
                .proxy
                .server_peer
                .as_deref()
                .ok_or_else(|| ProxyError::Config("client role needs proxy.server_peer".into()))
                .and_then(parse_peer_id)?;
            let listen = parse_socket_addr(&cfg.proxy.client_listen_addr)?;
            proxies.push(Box::new(ClientProxy::new(
                ProxyBase::new(
                    transport.with_policy(DialPolicy::DialOnly),
                    legs,
                    scheduler.clone(),
                    delay_ms,
                ),
                server_peer,
                listen,
            )));
        }
        Role::ClientServer => {
            let game_server = parse_socket_addr(&cfg.proxy.game_server_addr)?;
            let listen = parse_socket_addr(&cfg.proxy.client_listen_addr)?;
            participants.retain(|peer| *peer != local);
            proxies.push(Box::new(ClientServerProxy::new(
                ProxyBase::new(
                    transport.with_policy(DialPolicy::TieBreak),
                    legs,
                    scheduler.clone(),
                    delay_ms,
                ),
                game_server,
                listen,
                participants,
            )));
        }
    }
    Ok(proxies)
}
