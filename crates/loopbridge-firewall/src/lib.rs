//! loopbridge Firewall -- game-aware filter on the authoritative program's output.
//!
//! Fragments are first put back together by a [`Defragmenter`], which the
//! program-facing leg runs on everything the session unwraps. The
//! [`Firewall`] then sees whole messages only: it decrypts each one, answers
//! echo-type messages locally, collapses redundant movement updates and
//! unmatched stop-attack commands, and re-encrypts what is left. Unknown
//! messages pass through byte for byte.

pub mod defrag;
pub mod messages;
pub mod tracker;

use loopbridge_crypto::GameCipher;
use loopbridge_enet::WrappedPacket;
use tracing::{debug, warn};

pub use defrag::Defragmenter;
pub use messages::{tags, AttackKind, UnitAttack, Waypoint, WaypointEntry, WaypointGroup};
pub use tracker::{AttackTracker, MovementTracker};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("malformed message {tag:#04x}: {reason}")]
    MalformedMessage { tag: u8, reason: &'static str },
    #[error("fragment of {start_sequence_number} out of bounds: offset {offset} + {len} > {total_length}")]
    FragmentOutOfBounds {
        start_sequence_number: u16,
        offset: u32,
        len: usize,
        total_length: u32,
    },
    #[error("fragment of {start_sequence_number} disagrees with its siblings")]
    FragmentMismatch { start_sequence_number: u16 },
}

/// What one batch of program output turned into.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    /// Packets to relay to the remote participant.
    pub forward: Vec<WrappedPacket>,
    /// Acknowledgements to hand straight back to the program.
    pub replies: Vec<WrappedPacket>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FirewallStats {
    pub echoed: u64,
    pub movement_dropped: u64,
    pub movement_trimmed: u64,
    pub attacks_dropped: u64,
    pub acks_dropped: u64,
}

/// Filter state for one program leg. Not shared between routes.
#[derive(Debug)]
pub struct Firewall {
    cipher: GameCipher,
    movement: MovementTracker,
    attacks: AttackTracker,
    stats: FirewallStats,
}

impl Firewall {
    pub fn new(cipher: GameCipher) -> Self {
        Self {
            cipher,
            movement: MovementTracker::new(),
            attacks: AttackTracker::new(),
            stats: FirewallStats::default(),
        }
    }

    pub fn stats(&self) -> FirewallStats {
        self.stats
    }

    /// Filter whole messages the program sent towards the network. A
    /// packet still carrying a fragment descriptor cannot be inspected and
    /// is forwarded as is.
    pub fn process(&mut self, packets: Vec<WrappedPacket>) -> FilterOutcome {
        let mut outcome = FilterOutcome::default();
        for packet in packets {
            if packet.fragment.is_some() {
                debug!(channel = packet.channel_id, "firewall: passing through fragment");
                outcome.forward.push(packet);
                continue;
            }
            self.inspect(packet, &mut outcome);
        }
        outcome
    }

    /// Filter packets arriving from the network for the program. Movement
    /// acknowledgements are dropped; this side already answered them.
    pub fn inbound(&mut self, mut packets: Vec<WrappedPacket>) -> Vec<WrappedPacket> {
        let before = packets.len();
        packets.retain(|packet| {
            packet.fragment.is_some()
                || self.cipher.decrypt(&packet.data).first() != Some(&tags::WAYPOINT_ACK)
        });
        self.stats.acks_dropped += (before - packets.len()) as u64;
        packets
    }

    fn inspect(&mut self, packet: WrappedPacket, outcome: &mut FilterOutcome) {
        let plain = self.cipher.decrypt(&packet.data);
        let Some((tag, sender)) = messages::read_header(&plain) else {
            outcome.forward.push(packet);
            return;
        };

        if let Some(reply_tag) = messages::echo_reply_tag(tag) {
            let reply = messages::echo_reply(&plain, reply_tag);
            outcome.replies.push(self.seal(packet.channel_id, &reply));
            self.stats.echoed += 1;
            debug!(tag, sender, "firewall: answered echo locally");
            return;
        }

        match tag {
            tags::WAYPOINT_GROUP => self.inspect_movement(packet, &plain, outcome),
            tags::UNIT_ATTACK => match UnitAttack::decode(&plain) {
                Ok(attack) => {
                    if self.attacks.allow(&attack) {
                        outcome.forward.push(packet);
                    } else {
                        self.stats.attacks_dropped += 1;
                        debug!(unit = attack.unit_net_id, "firewall: dropped stop for idle unit");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "firewall: passing through unparsed attack");
                    outcome.forward.push(packet);
                }
            },
            _ => outcome.forward.push(packet),
        }
    }

    fn inspect_movement(&mut self, packet: WrappedPacket, plain: &[u8], outcome: &mut FilterOutcome) {
        let group = match WaypointGroup::decode(plain) {
            Ok(group) => group,
            Err(e) => {
                warn!(error = %e, "firewall: passing through unparsed movement");
                outcome.forward.push(packet);
                return;
            }
        };

        outcome.replies.push(self.seal(packet.channel_id, &group.ack()));

        let original = group.entries.len();
        match self.movement.filter(group) {
            None => {
                self.stats.movement_dropped += 1;
                debug!(entries = original, "firewall: dropped redundant movement");
            }
            Some(kept) if kept.entries.len() == original => outcome.forward.push(packet),
            Some(kept) => {
                self.stats.movement_trimmed += 1;
                debug!(
                    entries = original,
                    kept = kept.entries.len(),
                    "firewall: trimmed movement"
                );
                outcome.forward.push(self.seal(packet.channel_id, &kept.encode()));
            }
        }
    }

    fn seal(&self, channel_id: u8, plain: &[u8]) -> WrappedPacket {
        WrappedPacket::new(channel_id, self.cipher.encrypt(plain))
    }
}
