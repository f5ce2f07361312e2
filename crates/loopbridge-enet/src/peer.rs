//! Reduced ENet connection endpoint.
//!
//! A [`SessionPeer`] terminates one side of one ENet connection. It turns raw
//! datagrams into application payloads and produces the handshake and
//! acknowledgement chatter a real ENet host would, without retransmission,
//! congestion control or outbound fragmentation.
//!
//! Every method that produces output returns at most one datagram; the
//! caller owns the socket.

use std::collections::HashMap;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::command::{
    flags, Acknowledge, Command, CommandBody, Connect, Disconnect, SendUnreliable, VerifyConnect,
    CONNECTION_CHANNEL,
};
use crate::header::Header;
use crate::packet::WrappedPacket;
use crate::version::ProtocolVersion;
use crate::{encode_datagram, SessionError};

const DEFAULT_MTU: u16 = 996;
const DEFAULT_WINDOW_SIZE: u32 = 32768;
const DEFAULT_CHANNEL_COUNT: u32 = 8;
const THROTTLE_INTERVAL: u32 = 5000;
const THROTTLE_ACCELERATION: u32 = 2;
const THROTTLE_DECELERATION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    /// Connect sent, waiting for VerifyConnect.
    Connecting,
    Connected,
    Disconnected,
}

/// Sequence counters of one ENet channel. Counters wrap at `u16::MAX` like
/// the wire fields they feed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub reliable_sequence_number: u16,
    pub unreliable_sequence_number: u16,
}

/// Result of feeding one inbound datagram to a [`SessionPeer`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Received {
    pub packets: Vec<WrappedPacket>,
    /// Acknowledgements and handshake replies, as one datagram.
    pub reply: Option<Vec<u8>>,
    /// The remote side sent Disconnect.
    pub disconnected: bool,
}

#[derive(Debug)]
pub struct SessionPeer {
    version: ProtocolVersion,
    state: SessionState,
    session_id: u32,
    /// Id we announce as our outgoing peer id.
    local_peer_id: u16,
    /// Id the remote announced; written into every outbound header.
    remote_peer_id: u16,
    channels: HashMap<u8, Channel>,
    start_time: Instant,
}

impl SessionPeer {
    pub fn new(version: ProtocolVersion, local_peer_id: u16) -> Self {
        Self {
            version,
            state: SessionState::Unconnected,
            session_id: 0,
            local_peer_id: local_peer_id & version.max_peer_id,
            remote_peer_id: version.max_peer_id,
            channels: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn local_peer_id(&self) -> u16 {
        self.local_peer_id
    }

    pub fn remote_peer_id(&self) -> u16 {
        self.remote_peer_id
    }

    pub fn channel(&self, id: u8) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Start the handshake with a fresh synthetic session id.
    pub fn connect(&mut self) -> Result<Vec<u8>, SessionError> {
        let session_id = rand::thread_rng().gen_range(1..=self.version.max_session_id());
        self.connect_as(session_id, self.local_peer_id)
    }

    /// Start the handshake under a given session identity, so the remote's
    /// replies carry the same header fields another session already uses.
    pub fn connect_as(
        &mut self,
        session_id: u32,
        outgoing_peer_id: u16,
    ) -> Result<Vec<u8>, SessionError> {
        if self.state != SessionState::Unconnected {
            return Err(SessionError::InvalidState {
                expected: SessionState::Unconnected,
                actual: self.state,
            });
        }

        self.session_id = session_id & self.version.max_session_id();
        self.local_peer_id = outgoing_peer_id & self.version.max_peer_id;

        let sequence = self.next_reliable(CONNECTION_CHANNEL);
        let command = Command::new(
            flags::ACKNOWLEDGE,
            CONNECTION_CHANNEL,
            sequence,
            CommandBody::Connect(Connect {
                outgoing_peer_id: self.local_peer_id,
                mtu: DEFAULT_MTU,
                window_size: DEFAULT_WINDOW_SIZE,
                channel_count: DEFAULT_CHANNEL_COUNT,
                incoming_bandwidth: 0,
                outgoing_bandwidth: 0,
                packet_throttle_interval: THROTTLE_INTERVAL,
                packet_throttle_acceleration: THROTTLE_ACCELERATION,
                packet_throttle_deceleration: THROTTLE_DECELERATION,
                session_id: self.session_id,
            }),
        );

        self.state = SessionState::Connecting;
        debug!(
            session = self.session_id,
            peer = self.local_peer_id,
            "enet: connecting"
        );
        Ok(self.datagram(&[command]))
    }

    /// Process one inbound datagram.
    ///
    /// Malformed input is logged and the rest of the datagram abandoned;
    /// whatever was parsed before the fault is still acted upon.
    pub fn receive_packets(&mut self, buf: &[u8]) -> Received {
        let mut received = Received::default();
        let mut cursor = buf;

        let header = match Header::read(&mut cursor, self.version) {
            Ok(header) => header,
            Err(e) => {
                warn!(error = %e, len = buf.len(), "enet: dropping malformed datagram");
                return received;
            }
        };
        trace!(len = buf.len(), data = %hex::encode(buf), "enet: datagram in");

        let mut replies = Vec::new();
        while !cursor.is_empty() {
            let command = match Command::read(&mut cursor) {
                Ok(command) => command,
                Err(e) => {
                    warn!(
                        error = %e,
                        remaining = cursor.len(),
                        "enet: malformed command, abandoning rest of datagram"
                    );
                    break;
                }
            };

            if command.wants_acknowledge() {
                replies.push(self.acknowledge(&command, &header));
            }

            match &command.body {
                CommandBody::Connect(connect) => {
                    replies.push(self.accept(connect));
                }
                CommandBody::VerifyConnect(verify) => {
                    self.session_id = header.session_id;
                    self.remote_peer_id = verify.outgoing_peer_id & self.version.max_peer_id;
                    self.state = SessionState::Connected;
                    debug!(
                        session = self.session_id,
                        remote_peer = self.remote_peer_id,
                        "enet: connection verified"
                    );
                }
                CommandBody::Disconnect(_) => {
                    self.state = SessionState::Disconnected;
                    received.disconnected = true;
                    debug!(session = self.session_id, "enet: remote disconnected");
                }
                body => {
                    if let Some(packet) = WrappedPacket::from_command(command.channel_id, body) {
                        received.packets.push(packet);
                    }
                }
            }
        }

        if !replies.is_empty() {
            received.reply = Some(self.datagram(&replies));
        }
        received
    }

    /// Wrap each packet as SendUnreliable on its channel. Returns `None` when
    /// nothing was sendable.
    pub fn send_unreliable(&mut self, packets: &[WrappedPacket]) -> Option<Vec<u8>> {
        let mut commands = Vec::with_capacity(packets.len());
        for packet in packets {
            if let Err(e) = Command::check_payload(&packet.data) {
                warn!(error = %e, channel = packet.channel_id, "enet: dropping oversized packet");
                continue;
            }
            let channel = self.channels.entry(packet.channel_id).or_default();
            channel.unreliable_sequence_number = channel.unreliable_sequence_number.wrapping_add(1);
            commands.push(Command::new(
                0,
                packet.channel_id,
                channel.reliable_sequence_number,
                CommandBody::SendUnreliable(SendUnreliable {
                    unreliable_sequence_number: channel.unreliable_sequence_number,
                    data: packet.data.clone(),
                }),
            ));
        }

        if commands.is_empty() {
            return None;
        }
        Some(self.datagram(&commands))
    }

    /// Tell the remote the connection is going away. Returns `None` if no
    /// connection was ever started or it is already closed.
    pub fn disconnect(&mut self) -> Option<Vec<u8>> {
        match self.state {
            SessionState::Connecting | SessionState::Connected => {
                let sequence = self.next_reliable(CONNECTION_CHANNEL);
                let command = Command::new(
                    flags::ACKNOWLEDGE,
                    CONNECTION_CHANNEL,
                    sequence,
                    CommandBody::Disconnect(Disconnect { data: 0 }),
                );
                self.state = SessionState::Disconnected;
                Some(self.datagram(&[command]))
            }
            SessionState::Unconnected | SessionState::Disconnected => None,
        }
    }

    fn accept(&mut self, connect: &Connect) -> Command {
        self.session_id = connect.session_id & self.version.max_session_id();
        self.remote_peer_id = connect.outgoing_peer_id & self.version.max_peer_id;
        self.state = SessionState::Connected;
        debug!(
            session = self.session_id,
            remote_peer = self.remote_peer_id,
            "enet: accepted connection"
        );

        let sequence = self.next_reliable(CONNECTION_CHANNEL);
        Command::new(
            flags::ACKNOWLEDGE,
            CONNECTION_CHANNEL,
            sequence,
            CommandBody::VerifyConnect(VerifyConnect {
                outgoing_peer_id: self.local_peer_id,
                mtu: connect.mtu,
                window_size: connect.window_size,
                channel_count: connect.channel_count,
                incoming_bandwidth: connect.incoming_bandwidth,
                outgoing_bandwidth: connect.outgoing_bandwidth,
                packet_throttle_interval: connect.packet_throttle_interval,
                packet_throttle_acceleration: connect.packet_throttle_acceleration,
                packet_throttle_deceleration: connect.packet_throttle_deceleration,
            }),
        )
    }

    fn acknowledge(&self, command: &Command, header: &Header) -> Command {
        Command::new(
            0,
            command.channel_id,
            command.reliable_sequence_number,
            CommandBody::Acknowledge(Acknowledge {
                received_reliable_sequence_number: command.reliable_sequence_number,
                received_sent_time: header.time_sent.unwrap_or(0),
            }),
        )
    }

    fn next_reliable(&mut self, channel_id: u8) -> u16 {
        let channel = self.channels.entry(channel_id).or_default();
        channel.reliable_sequence_number = channel.reliable_sequence_number.wrapping_add(1);
        channel.reliable_sequence_number
    }

    fn datagram(&self, commands: &[Command]) -> Vec<u8> {
        let header = Header {
            session_id: self.session_id,
            peer_id: self.remote_peer_id,
            time_sent: Some(self.start_time.elapsed().as_millis() as u16),
        };
        let out = encode_datagram(&header, commands, self.version);
        trace!(len = out.len(), data = %hex::encode(&out), "enet: datagram out");
        out
    }
}
