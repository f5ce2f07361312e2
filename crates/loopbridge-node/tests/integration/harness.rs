//! Test harness for in-process loopbridge integration tests.
//!
//! Provides TestNode (one node's transport, scheduler and proxy builders on a
//! shared in-memory network) plus FakeGameServer and FakeGameClient, which
//! speak ENet over real loopback UDP sockets the way game processes do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use libp2p::PeerId;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use loopbridge_enet::{
    encode_datagram, flags, Command, CommandBody, Header, ProtocolVersion, Received, SendReliable,
    SessionPeer, WrappedPacket,
};
use loopbridge_node::clock::SyncClock;
use loopbridge_node::config::NodeConfig;
use loopbridge_node::leg_factory;
use loopbridge_node::leg::{EnetLegs, LegFactory};
use loopbridge_node::net::{MemoryHub, P2pNetwork};
use loopbridge_node::proxy::{
    ClientProxy, ClientServerProxy, ProxyBase, ProxyEvent, ServerProxy,
};
use loopbridge_node::scheduler::Scheduler;
use loopbridge_node::transport::{DialPolicy, StreamTransport};

pub const DELAY_MS: u64 = 100;
pub const TICK: Duration = Duration::from_millis(5);
/// Loopback hops and task wakeups on top of the scheduled delay.
pub const SLACK: Duration = Duration::from_millis(40);
pub const TIMEOUT: Duration = Duration::from_secs(5);

const VERSION: ProtocolVersion = ProtocolVersion::COMPACT;

/// Base64 Blowfish key shared by filtered nodes and the fake game processes.
pub const CIPHER_KEY: &str = "17BLOhi6KZsTtldTsizvHg==";

pub fn loopback_any() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

/// One node on a shared in-memory network.
pub struct TestNode {
    pub peer_id: PeerId,
    pub transport: StreamTransport,
    pub scheduler: Scheduler,
    legs: Arc<dyn LegFactory>,
}

#[allow(dead_code)]
impl TestNode {
    pub fn new(hub: &MemoryHub) -> Self {
        let network = Arc::new(hub.node());
        let peer_id = network.local_peer_id();
        Self {
            peer_id,
            transport: StreamTransport::new(network, DialPolicy::TieBreak),
            scheduler: Scheduler::new(SyncClock::new(), TICK),
            legs: Arc::new(EnetLegs::new(VERSION)),
        }
    }

    /// A node whose program legs run through the firewall, configured the
    /// way the binary configures it.
    pub fn with_firewall(hub: &MemoryHub) -> Self {
        let mut cfg = NodeConfig::default();
        cfg.firewall.enabled = true;
        cfg.firewall.cipher_key = Some(CIPHER_KEY.into());
        Self {
            legs: leg_factory(&cfg).unwrap(),
            ..Self::new(hub)
        }
    }

    fn base(&self, policy: DialPolicy) -> ProxyBase {
        ProxyBase::new(
            self.transport.with_policy(policy),
            self.legs.clone(),
            self.scheduler.clone(),
            DELAY_MS,
        )
    }

    pub fn server(&self, game_server: SocketAddr, participants: Vec<PeerId>) -> ServerProxy {
        ServerProxy::new(self.base(DialPolicy::ListenOnly), game_server, participants)
    }

    pub fn client(&self, server_peer: PeerId) -> ClientProxy {
        ClientProxy::new(self.base(DialPolicy::DialOnly), server_peer, loopback_any())
    }

    pub fn client_at(&self, server_peer: PeerId, listen: SocketAddr) -> ClientProxy {
        ClientProxy::new(self.base(DialPolicy::DialOnly), server_peer, listen)
    }

    pub fn client_server(
        &self,
        game_server: SocketAddr,
        participants: Vec<PeerId>,
    ) -> ClientServerProxy {
        ClientServerProxy::new(
            self.base(DialPolicy::TieBreak),
            game_server,
            loopback_any(),
            participants,
        )
    }
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_event<F>(
    events: &mut broadcast::Receiver<ProxyEvent>,
    pred: F,
) -> anyhow::Result<ProxyEvent>
where
    F: Fn(&ProxyEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timeout waiting for proxy event"))??;
        if pred(&event) {
            return Ok(event);
        }
    }
}

/// An authoritative game process: accepts any number of ENet connections.
pub struct FakeGameServer {
    socket: UdpSocket,
    sessions: HashMap<SocketAddr, SessionPeer>,
    buf: Vec<u8>,
}

/// One datagram as the fake server saw it.
pub struct Arrival {
    pub from: SocketAddr,
    pub received: Received,
    pub newly_connected: bool,
}

#[allow(dead_code)]
impl FakeGameServer {
    pub async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind(loopback_any()).await.unwrap(),
            sessions: HashMap::new(),
            buf: vec![0; 64 * 1024],
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    pub fn session(&self, from: &SocketAddr) -> Option<&SessionPeer> {
        self.sessions.get(from)
    }

    /// Receive one datagram, answering whatever the session wants answered.
    pub async fn next(&mut self) -> Arrival {
        let (len, from) = tokio::time::timeout(TIMEOUT, self.socket.recv_from(&mut self.buf))
            .await
            .expect("game server timed out waiting for a datagram")
            .unwrap();
        let next_id = self.sessions.len() as u16;
        let session = self
            .sessions
            .entry(from)
            .or_insert_with(|| SessionPeer::new(VERSION, next_id));
        let was_connected = session.is_connected();
        let received = session.receive_packets(&self.buf[..len]);
        let newly_connected = !was_connected && session.is_connected();
        if let Some(reply) = &received.reply {
            self.socket.send_to(reply, from).await.unwrap();
        }
        Arrival {
            from,
            received,
            newly_connected,
        }
    }

    /// Wait for a proxy leg to connect; returns its address.
    pub async fn accept(&mut self) -> SocketAddr {
        loop {
            let arrival = self.next().await;
            if arrival.newly_connected {
                return arrival.from;
            }
        }
    }

    /// Wait for a datagram carrying application packets.
    pub async fn recv_packets(&mut self) -> (SocketAddr, Vec<WrappedPacket>) {
        loop {
            let arrival = self.next().await;
            if !arrival.received.packets.is_empty() {
                return (arrival.from, arrival.received.packets);
            }
        }
    }

    /// Wait until the connection at `from` is told to disconnect.
    pub async fn wait_disconnect(&mut self, from: SocketAddr) {
        loop {
            let arrival = self.next().await;
            if arrival.from == from && arrival.received.disconnected {
                return;
            }
        }
    }

    pub async fn send(&mut self, to: SocketAddr, packets: &[WrappedPacket]) {
        let session = self.sessions.get_mut(&to).expect("no connection from that address");
        let datagram = session.send_unreliable(packets).expect("nothing to send");
        self.socket.send_to(&datagram, to).await.unwrap();
    }
}

/// A game client connected to a proxy's listen socket.
pub struct FakeGameClient {
    socket: UdpSocket,
    proxy: SocketAddr,
    session: SessionPeer,
    sequence: u16,
    buf: Vec<u8>,
}

#[allow(dead_code)]
impl FakeGameClient {
    /// Bind, send Connect, and wait for the proxy's VerifyConnect.
    pub async fn connect(proxy: SocketAddr) -> Self {
        let mut client = Self {
            socket: UdpSocket::bind(loopback_any()).await.unwrap(),
            proxy,
            session: SessionPeer::new(VERSION, 7),
            sequence: 0,
            buf: vec![0; 64 * 1024],
        };
        let connect = client.session.connect().unwrap();
        client.socket.send_to(&connect, proxy).await.unwrap();
        while !client.session.is_connected() {
            client.next().await;
        }
        client
    }

    pub fn session(&self) -> &SessionPeer {
        &self.session
    }

    async fn next(&mut self) -> Received {
        let (len, _) = tokio::time::timeout(TIMEOUT, self.socket.recv_from(&mut self.buf))
            .await
            .expect("game client timed out waiting for a datagram")
            .unwrap();
        let received = self.session.receive_packets(&self.buf[..len]);
        if let Some(reply) = &received.reply {
            self.socket.send_to(reply, self.proxy).await.unwrap();
        }
        received
    }

    /// Send `data` as one reliable ENet message on `channel`.
    pub async fn send_reliable(&mut self, channel: u8, data: &[u8]) {
        self.sequence = self.sequence.wrapping_add(1);
        let datagram = encode_datagram(
            &Header {
                session_id: self.session.session_id(),
                peer_id: self.session.remote_peer_id(),
                time_sent: Some(self.sequence),
            },
            &[Command::new(
                flags::ACKNOWLEDGE,
                channel,
                self.sequence,
                CommandBody::SendReliable(SendReliable {
                    data: data.to_vec(),
                }),
            )],
            VERSION,
        );
        self.socket.send_to(&datagram, self.proxy).await.unwrap();
    }

    /// Wait for a datagram carrying application packets.
    pub async fn recv_packets(&mut self) -> Vec<WrappedPacket> {
        loop {
            let received = self.next().await;
            if !received.packets.is_empty() {
                return received.packets;
            }
        }
    }

    pub async fn disconnect(&mut self) {
        if let Some(datagram) = self.session.disconnect() {
            self.socket.send_to(&datagram, self.proxy).await.unwrap();
        }
    }
}
