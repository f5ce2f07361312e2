//! Firewall decorator over the leg factory.
//!
//! Program legs built through [`FirewallLegs`] run every whole message the
//! program emits through a [`Firewall`]. The wrapped leg has already put
//! fragmented sends back together, so the firewall never sees a fragment. Acknowledgements the firewall
//! synthesizes go back to the program through the same session, so its
//! sequence numbers stay consistent.

use std::sync::Arc;

use loopbridge_crypto::GameCipher;
use loopbridge_enet::{SessionError, SessionPeer, WrappedPacket};
use loopbridge_firewall::Firewall;

use crate::leg::{Ingested, LegFactory, PacketLeg};

pub struct FilteredLeg {
    inner: Box<dyn PacketLeg>,
    firewall: Firewall,
}

impl FilteredLeg {
    pub fn new(inner: Box<dyn PacketLeg>, firewall: Firewall) -> Self {
        Self { inner, firewall }
    }
}

impl PacketLeg for FilteredLeg {
    fn session(&self) -> &SessionPeer {
        self.inner.session()
    }

    fn connect(&mut self) -> Result<Vec<u8>, SessionError> {
        self.inner.connect()
    }

    fn connect_as(
        &mut self,
        session_id: u32,
        outgoing_peer_id: u16,
    ) -> Result<Vec<u8>, SessionError> {
        self.inner.connect_as(session_id, outgoing_peer_id)
    }

    fn ingest(&mut self, datagram: &[u8]) -> Ingested {
        let mut ingested = self.inner.ingest(datagram);
        if ingested.packets.is_empty() {
            return ingested;
        }

        let outcome = self.firewall.process(std::mem::take(&mut ingested.packets));
        if !outcome.replies.is_empty() {
            if let Some(reply) = self.inner.deliver(outcome.replies) {
                ingested.replies.push(reply);
            }
        }
        ingested.packets = outcome.forward;
        ingested
    }

    fn deliver(&mut self, packets: Vec<WrappedPacket>) -> Option<Vec<u8>> {
        let packets = self.firewall.inbound(packets);
        self.inner.deliver(packets)
    }

    fn disconnect(&mut self) -> Option<Vec<u8>> {
        let stats = self.firewall.stats();
        tracing::debug!(
            echoed = stats.echoed,
            movement_dropped = stats.movement_dropped,
            movement_trimmed = stats.movement_trimmed,
            attacks_dropped = stats.attacks_dropped,
            acks_dropped = stats.acks_dropped,
            "firewall: leg closing"
        );
        self.inner.disconnect()
    }
}

/// Wraps another factory so every program leg gets its own firewall.
pub struct FirewallLegs {
    inner: Arc<dyn LegFactory>,
    cipher: GameCipher,
}

impl FirewallLegs {
    pub fn new(inner: Arc<dyn LegFactory>, cipher: GameCipher) -> Self {
        Self { inner, cipher }
    }
}

impl LegFactory for FirewallLegs {
    fn program_leg(&self, local_peer_id: u16) -> Box<dyn PacketLeg> {
        Box::new(FilteredLeg::new(
            self.inner.program_leg(local_peer_id),
            Firewall::new(self.cipher.clone()),
        ))
    }

    fn plain_leg(&self, local_peer_id: u16) -> Box<dyn PacketLeg> {
        self.inner.plain_leg(local_peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leg::EnetLegs;
    use loopbridge_enet::{
        encode_datagram, flags, Command, CommandBody, Header, ProtocolVersion, SendFragment,
        SendReliable,
    };
    use loopbridge_firewall::tags;

    fn cipher() -> GameCipher {
        GameCipher::new(b"17BLOhi6KZsTtldTsizvHg==").unwrap()
    }

    fn factory() -> FirewallLegs {
        FirewallLegs::new(Arc::new(EnetLegs::new(ProtocolVersion::COMPACT)), cipher())
    }

    /// A leg connected to a simulated authoritative process.
    fn connected(leg: &mut Box<dyn PacketLeg>) -> SessionPeer {
        let mut program = SessionPeer::new(ProtocolVersion::COMPACT, 0);
        let connect = leg.connect().unwrap();
        let accepted = program.receive_packets(&connect);
        let ingested = leg.ingest(&accepted.reply.unwrap());
        assert!(leg.session().is_connected());
        assert!(ingested.packets.is_empty());
        program
    }

    fn program_sends(program: &SessionPeer, sequence: u16, plain: &[u8]) -> Vec<u8> {
        encode_datagram(
            &Header {
                session_id: program.session_id(),
                peer_id: program.remote_peer_id(),
                time_sent: Some(1),
            },
            &[Command::new(
                flags::ACKNOWLEDGE,
                3,
                sequence,
                CommandBody::SendReliable(SendReliable {
                    data: cipher().encrypt(plain),
                }),
            )],
            ProtocolVersion::COMPACT,
        )
    }

    #[test]
    fn test_echo_answered_through_same_session() {
        let mut leg = factory().program_leg(1);
        let mut program = connected(&mut leg);

        let echo = [tags::SYNC_SIM_TIME, 1, 0, 0, 0, 0x10, 0x20, 0x30, 0x40];
        let ingested = leg.ingest(&program_sends(&program, 1, &echo));

        assert!(ingested.packets.is_empty());
        // Transport ack, then the synthesized game-level ack.
        assert_eq!(ingested.replies.len(), 2);
        let answer = program.receive_packets(&ingested.replies[1]);
        assert_eq!(answer.packets.len(), 1);
        assert_eq!(answer.packets[0].channel_id, 3);
        assert_eq!(cipher().decrypt(&answer.packets[0].data)[0], tags::SYNC_SIM_TIME_ACK);
    }

    #[test]
    fn test_fragmented_echo_answered_after_reassembly() {
        let mut leg = factory().program_leg(1);
        let mut program = connected(&mut leg);

        let echo = [tags::PING_LOAD_INFO, 1, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        let sealed = cipher().encrypt(&echo);
        let fragment = |number: u32| {
            let offset = number as usize * 8;
            encode_datagram(
                &Header {
                    session_id: program.session_id(),
                    peer_id: program.remote_peer_id(),
                    time_sent: Some(1),
                },
                &[Command::new(
                    flags::ACKNOWLEDGE,
                    3,
                    number as u16 + 1,
                    CommandBody::SendFragment(SendFragment {
                        start_sequence_number: 1,
                        fragment_count: 2,
                        fragment_number: number,
                        total_length: sealed.len() as u32,
                        fragment_offset: offset as u32,
                        data: sealed[offset..offset + 8].to_vec(),
                    }),
                )],
                ProtocolVersion::COMPACT,
            )
        };

        let first = leg.ingest(&fragment(0));
        assert!(first.packets.is_empty());
        assert_eq!(first.replies.len(), 1);

        let second = leg.ingest(&fragment(1));
        assert!(second.packets.is_empty());
        assert_eq!(second.replies.len(), 2);
        let answer = program.receive_packets(&second.replies[1]);
        assert_eq!(cipher().decrypt(&answer.packets[0].data)[0], tags::PING_LOAD_INFO_ACK);
    }

    #[test]
    fn test_unknown_messages_forwarded() {
        let mut leg = factory().program_leg(1);
        let program = connected(&mut leg);

        let message = [0x44, 1, 0, 0, 0, 1, 2, 3, 4, 5];
        let ingested = leg.ingest(&program_sends(&program, 1, &message));
        assert_eq!(ingested.packets.len(), 1);
        assert_eq!(cipher().decrypt(&ingested.packets[0].data), message.to_vec());
        assert_eq!(ingested.replies.len(), 1);
    }

    #[test]
    fn test_plain_leg_not_filtered() {
        let mut leg = factory().plain_leg(0);
        let mut client = SessionPeer::new(ProtocolVersion::COMPACT, 2);
        let connect = client.connect().unwrap();
        let ingested = leg.ingest(&connect);
        client.receive_packets(&ingested.replies[0]);

        let echo = [tags::SYNC_SIM_TIME, 1, 0, 0, 0, 0, 0, 0, 0];
        let ingested = leg.ingest(&program_sends(&client, 1, &echo));
        assert_eq!(ingested.packets.len(), 1);
    }

    #[test]
    fn test_inbound_movement_acks_dropped() {
        let mut leg = factory().program_leg(1);
        let mut program = connected(&mut leg);

        let ack = WrappedPacket::new(3, cipher().encrypt(&[tags::WAYPOINT_ACK, 1, 0, 0, 0, 1, 0, 0, 0, 1, 0]));
        let other = WrappedPacket::new(3, vec![1, 2, 3]);
        let datagram = leg.deliver(vec![ack, other.clone()]).unwrap();
        assert_eq!(program.receive_packets(&datagram).packets, vec![other]);
    }
}
