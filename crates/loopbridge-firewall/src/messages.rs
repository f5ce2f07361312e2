//! Decrypted game message layouts the filter understands.
//!
//! Little-endian, as the game writes them. Every message starts with a
//! one-byte type tag and the sender's 32-bit net id.

use bytes::{Buf, BufMut};

use crate::FilterError;

pub mod tags {
    pub const UNIT_ATTACK: u8 = 0x3A;
    pub const SYNC_SIM_TIME: u8 = 0x08;
    pub const SYNC_SIM_TIME_ACK: u8 = 0x09;
    pub const PING_LOAD_INFO: u8 = 0x14;
    pub const PING_LOAD_INFO_ACK: u8 = 0x15;
    pub const WAYPOINT_GROUP: u8 = 0x61;
    pub const WAYPOINT_ACK: u8 = 0x62;
}

/// Tag byte plus sender net id.
pub const MESSAGE_HEADER_LEN: usize = 5;

/// Tag of the acknowledgement the game expects for an echo-type message.
pub fn echo_reply_tag(tag: u8) -> Option<u8> {
    match tag {
        tags::SYNC_SIM_TIME => Some(tags::SYNC_SIM_TIME_ACK),
        tags::PING_LOAD_INFO => Some(tags::PING_LOAD_INFO_ACK),
        _ => None,
    }
}

/// Same sender and body as `message`, under the reply tag.
pub fn echo_reply(message: &[u8], reply_tag: u8) -> Vec<u8> {
    let mut out = message.to_vec();
    if let Some(tag) = out.first_mut() {
        *tag = reply_tag;
    }
    out
}

pub fn read_header(mut buf: &[u8]) -> Option<(u8, u32)> {
    if buf.len() < MESSAGE_HEADER_LEN {
        return None;
    }
    Some((buf.get_u8(), buf.get_u32_le()))
}

fn malformed(tag: u8, reason: &'static str) -> FilterError {
    FilterError::MalformedMessage { tag, reason }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Waypoint {
    pub x: i16,
    pub y: i16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaypointEntry {
    pub unit_net_id: u32,
    pub teleport_id: u8,
    /// First waypoint is the unit's current position.
    pub waypoints: Vec<Waypoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaypointGroup {
    pub sender: u32,
    pub sync_id: i32,
    pub entries: Vec<WaypointEntry>,
}

impl WaypointGroup {
    const FIXED_LEN: usize = MESSAGE_HEADER_LEN + 4 + 2;
    const ENTRY_FIXED_LEN: usize = 4 + 1 + 1;

    pub fn decode(mut buf: &[u8]) -> Result<Self, FilterError> {
        let tag = tags::WAYPOINT_GROUP;
        if buf.len() < Self::FIXED_LEN {
            return Err(malformed(tag, "short header"));
        }
        if buf.get_u8() != tag {
            return Err(malformed(tag, "wrong tag"));
        }
        let sender = buf.get_u32_le();
        let sync_id = buf.get_i32_le();
        let count = buf.get_u16_le();

        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            if buf.len() < Self::ENTRY_FIXED_LEN {
                return Err(malformed(tag, "short entry"));
            }
            let unit_net_id = buf.get_u32_le();
            let teleport_id = buf.get_u8();
            let waypoint_count = buf.get_u8() as usize;
            if buf.len() < waypoint_count * 4 {
                return Err(malformed(tag, "short waypoint list"));
            }
            let waypoints = (0..waypoint_count)
                .map(|_| Waypoint {
                    x: buf.get_i16_le(),
                    y: buf.get_i16_le(),
                })
                .collect();
            entries.push(WaypointEntry {
                unit_net_id,
                teleport_id,
                waypoints,
            });
        }

        if buf.has_remaining() {
            return Err(malformed(tag, "trailing bytes"));
        }
        Ok(Self {
            sender,
            sync_id,
            entries,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.entries.len() * 16);
        out.put_u8(tags::WAYPOINT_GROUP);
        out.put_u32_le(self.sender);
        out.put_i32_le(self.sync_id);
        out.put_u16_le(self.entries.len() as u16);
        for entry in &self.entries {
            out.put_u32_le(entry.unit_net_id);
            out.put_u8(entry.teleport_id);
            out.put_u8(entry.waypoints.len() as u8);
            for waypoint in &entry.waypoints {
                out.put_i16_le(waypoint.x);
                out.put_i16_le(waypoint.y);
            }
        }
        out
    }

    /// Acknowledgement for this group as originally received.
    pub fn ack(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESSAGE_HEADER_LEN + 6);
        out.put_u8(tags::WAYPOINT_ACK);
        out.put_u32_le(self.sender);
        out.put_i32_le(self.sync_id);
        out.put_u16_le(self.entries.len() as u16);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttackKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitAttack {
    pub sender: u32,
    pub unit_net_id: u32,
    pub kind: AttackKind,
    pub target_net_id: u32,
}

impl UnitAttack {
    const LEN: usize = MESSAGE_HEADER_LEN + 4 + 1 + 4;

    pub fn decode(mut buf: &[u8]) -> Result<Self, FilterError> {
        let tag = tags::UNIT_ATTACK;
        if buf.len() < Self::LEN {
            return Err(malformed(tag, "short message"));
        }
        if buf.get_u8() != tag {
            return Err(malformed(tag, "wrong tag"));
        }
        let sender = buf.get_u32_le();
        let unit_net_id = buf.get_u32_le();
        let kind = match buf.get_u8() {
            0 => AttackKind::Start,
            1 => AttackKind::Stop,
            _ => return Err(malformed(tag, "unknown attack kind")),
        };
        let target_net_id = buf.get_u32_le();
        Ok(Self {
            sender,
            unit_net_id,
            kind,
            target_net_id,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.put_u8(tags::UNIT_ATTACK);
        out.put_u32_le(self.sender);
        out.put_u32_le(self.unit_net_id);
        out.put_u8(match self.kind {
            AttackKind::Start => 0,
            AttackKind::Stop => 1,
        });
        out.put_u32_le(self.target_net_id);
        out
    }
}
