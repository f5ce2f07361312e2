//! Program-facing legs: the loopback UDP socket a game process talks to and
//! the [`SessionPeer`] that terminates its ENet connection.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::net::UdpSocket;

use loopbridge_enet::{ProtocolVersion, SessionError, SessionPeer, WrappedPacket};
use loopbridge_firewall::Defragmenter;

/// Largest datagram a leg will read.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// What one datagram from the program turned into.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// Whole application messages to relay.
    pub packets: Vec<WrappedPacket>,
    /// Datagrams to send straight back to the program.
    pub replies: Vec<Vec<u8>>,
    pub disconnected: bool,
}

/// One side of a program's ENet connection, as seen by a route.
pub trait PacketLeg: Send {
    fn session(&self) -> &SessionPeer;

    fn connect(&mut self) -> Result<Vec<u8>, SessionError>;

    fn connect_as(&mut self, session_id: u32, outgoing_peer_id: u16)
        -> Result<Vec<u8>, SessionError>;

    /// Process a datagram the program sent.
    fn ingest(&mut self, datagram: &[u8]) -> Ingested;

    /// Wrap relayed packets into one datagram for the program.
    fn deliver(&mut self, packets: Vec<WrappedPacket>) -> Option<Vec<u8>>;

    fn disconnect(&mut self) -> Option<Vec<u8>>;
}

/// Plain leg: session plus reassembly of the program's fragmented sends.
/// The relay only ever carries whole messages.
#[derive(Debug)]
pub struct EnetLeg {
    session: SessionPeer,
    defrag: Defragmenter,
}

impl EnetLeg {
    pub fn new(version: ProtocolVersion, local_peer_id: u16) -> Self {
        Self {
            session: SessionPeer::new(version, local_peer_id),
            defrag: Defragmenter::new(),
        }
    }
}

impl PacketLeg for EnetLeg {
    fn session(&self) -> &SessionPeer {
        &self.session
    }

    fn connect(&mut self) -> Result<Vec<u8>, SessionError> {
        self.session.connect()
    }

    fn connect_as(
        &mut self,
        session_id: u32,
        outgoing_peer_id: u16,
    ) -> Result<Vec<u8>, SessionError> {
        self.session.connect_as(session_id, outgoing_peer_id)
    }

    fn ingest(&mut self, datagram: &[u8]) -> Ingested {
        let received = self.session.receive_packets(datagram);
        let mut packets = Vec::with_capacity(received.packets.len());
        for packet in received.packets {
            match self.defrag.push(packet) {
                Ok(Some(whole)) => packets.push(whole),
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "leg: dropping fragment"),
            }
        }
        Ingested {
            packets,
            replies: received.reply.into_iter().collect(),
            disconnected: received.disconnected,
        }
    }

    fn deliver(&mut self, packets: Vec<WrappedPacket>) -> Option<Vec<u8>> {
        self.session.send_unreliable(&packets)
    }

    fn disconnect(&mut self) -> Option<Vec<u8>> {
        self.session.disconnect()
    }
}

/// Builds the legs routes run on. Decorated to add filtering.
pub trait LegFactory: Send + Sync {
    /// Leg facing an authoritative process; subject to filtering.
    fn program_leg(&self, local_peer_id: u16) -> Box<dyn PacketLeg>;

    /// Leg that is never filtered: the local game client, and the local
    /// participant's connection whose output goes to that client verbatim.
    fn plain_leg(&self, local_peer_id: u16) -> Box<dyn PacketLeg>;
}

#[derive(Debug, Clone, Copy)]
pub struct EnetLegs {
    version: ProtocolVersion,
}

impl EnetLegs {
    pub fn new(version: ProtocolVersion) -> Self {
        Self { version }
    }
}

impl LegFactory for EnetLegs {
    fn program_leg(&self, local_peer_id: u16) -> Box<dyn PacketLeg> {
        Box::new(EnetLeg::new(self.version, local_peer_id))
    }

    fn plain_leg(&self, local_peer_id: u16) -> Box<dyn PacketLeg> {
        Box::new(EnetLeg::new(self.version, local_peer_id))
    }
}

/// Loopback UDP socket facing one game process.
///
/// Either pinned to a known program address (we connect to an authoritative
/// process) or bound where the program connects to us, in which case the
/// program's address is learned from whatever last wrote to the socket.
#[derive(Debug)]
pub struct ProgramSocket {
    socket: UdpSocket,
    program: Option<SocketAddr>,
    pinned: bool,
}

impl ProgramSocket {
    /// Ephemeral loopback socket talking to the program at `program`.
    pub async fn connect(program: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if program.is_ipv4() {
            (Ipv4Addr::LOCALHOST, 0).into()
        } else {
            (Ipv6Addr::LOCALHOST, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            program: Some(program),
            pinned: true,
        })
    }

    /// Socket at `addr` a program will connect to.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            program: None,
            pinned: false,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn program_addr(&self) -> Option<SocketAddr> {
        self.program
    }

    /// Next datagram from the program. Cancel safe.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let (len, from) = self.socket.recv_from(buf).await?;
            match self.program {
                Some(program) if self.pinned && program != from => {
                    tracing::debug!(%from, "leg: ignoring datagram from stranger");
                }
                Some(program) if program == from => return Ok(len),
                _ => {
                    tracing::debug!(%from, "leg: program attached");
                    self.program = Some(from);
                    return Ok(len);
                }
            }
        }
    }

    /// Send to the program. Failures are logged and swallowed; UDP never
    /// promised delivery anyway.
    pub async fn send(&self, datagram: &[u8]) -> bool {
        let Some(program) = self.program else {
            tracing::debug!(len = datagram.len(), "leg: no program attached yet, dropping datagram");
            return false;
        };
        match self.socket.send_to(datagram, program).await {
            Ok(_) => {
                tracing::trace!(%program, data = %hex::encode(datagram), "leg: datagram out");
                true
            }
            Err(e) => {
                tracing::warn!(%program, "leg: send failed: {e}");
                false
            }
        }
    }
}
