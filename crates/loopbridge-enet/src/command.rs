//! ENet commands: a four-byte command header followed by a variant body.
//!
//! Byte 0 carries the flags in its high nibble and the command id in its low
//! nibble, byte 1 the channel id, bytes 2-3 the reliable sequence number.

use bytes::{Buf, BufMut};

use crate::{ensure, WireError};

/// Command flags, already shifted into the high nibble of byte 0.
pub mod flags {
    pub const ACKNOWLEDGE: u8 = 0x80;
    pub const UNSEQUENCED: u8 = 0x40;
}

/// Channel reserved for connection management commands.
pub const CONNECTION_CHANNEL: u8 = 0xFF;

/// Size of the command header shared by every variant.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Largest payload a `u16` length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandId {
    Acknowledge = 1,
    Connect = 2,
    VerifyConnect = 3,
    Disconnect = 4,
    Ping = 5,
    SendReliable = 6,
    SendUnreliable = 7,
    SendFragment = 8,
    SendUnsequenced = 9,
    BandwidthLimit = 10,
    ThrottleConfigure = 11,
}

impl TryFrom<u8> for CommandId {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::Acknowledge,
            2 => Self::Connect,
            3 => Self::VerifyConnect,
            4 => Self::Disconnect,
            5 => Self::Ping,
            6 => Self::SendReliable,
            7 => Self::SendUnreliable,
            8 => Self::SendFragment,
            9 => Self::SendUnsequenced,
            10 => Self::BandwidthLimit,
            11 => Self::ThrottleConfigure,
            other => return Err(WireError::UnknownCommand(other)),
        })
    }
}

/// Fixed-layout part of a command body. `read` may assume `FIXED_SIZE`
/// bytes are available; variable-length data is checked separately.
trait Body: Sized {
    const FIXED_SIZE: usize;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError>;

    fn write<B: BufMut>(&self, out: &mut B);

    fn size(&self) -> usize {
        Self::FIXED_SIZE
    }
}

fn read_data(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, WireError> {
    ensure(buf, len)?;
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acknowledge {
    pub received_reliable_sequence_number: u16,
    pub received_sent_time: u16,
}

impl Body for Acknowledge {
    const FIXED_SIZE: usize = 4;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            received_reliable_sequence_number: buf.get_u16(),
            received_sent_time: buf.get_u16(),
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.received_reliable_sequence_number);
        out.put_u16(self.received_sent_time);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connect {
    pub outgoing_peer_id: u16,
    pub mtu: u16,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
    pub session_id: u32,
}

impl Body for Connect {
    const FIXED_SIZE: usize = 36;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            outgoing_peer_id: buf.get_u16(),
            mtu: buf.get_u16(),
            window_size: buf.get_u32(),
            channel_count: buf.get_u32(),
            incoming_bandwidth: buf.get_u32(),
            outgoing_bandwidth: buf.get_u32(),
            packet_throttle_interval: buf.get_u32(),
            packet_throttle_acceleration: buf.get_u32(),
            packet_throttle_deceleration: buf.get_u32(),
            session_id: buf.get_u32(),
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.outgoing_peer_id);
        out.put_u16(self.mtu);
        out.put_u32(self.window_size);
        out.put_u32(self.channel_count);
        out.put_u32(self.incoming_bandwidth);
        out.put_u32(self.outgoing_bandwidth);
        out.put_u32(self.packet_throttle_interval);
        out.put_u32(self.packet_throttle_acceleration);
        out.put_u32(self.packet_throttle_deceleration);
        out.put_u32(self.session_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyConnect {
    pub outgoing_peer_id: u16,
    pub mtu: u16,
    pub window_size: u32,
    pub channel_count: u32,
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
}

impl Body for VerifyConnect {
    const FIXED_SIZE: usize = 32;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            outgoing_peer_id: buf.get_u16(),
            mtu: buf.get_u16(),
            window_size: buf.get_u32(),
            channel_count: buf.get_u32(),
            incoming_bandwidth: buf.get_u32(),
            outgoing_bandwidth: buf.get_u32(),
            packet_throttle_interval: buf.get_u32(),
            packet_throttle_acceleration: buf.get_u32(),
            packet_throttle_deceleration: buf.get_u32(),
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.outgoing_peer_id);
        out.put_u16(self.mtu);
        out.put_u32(self.window_size);
        out.put_u32(self.channel_count);
        out.put_u32(self.incoming_bandwidth);
        out.put_u32(self.outgoing_bandwidth);
        out.put_u32(self.packet_throttle_interval);
        out.put_u32(self.packet_throttle_acceleration);
        out.put_u32(self.packet_throttle_deceleration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnect {
    pub data: u32,
}

impl Body for Disconnect {
    const FIXED_SIZE: usize = 4;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self { data: buf.get_u32() })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.data);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReliable {
    pub data: Vec<u8>,
}

impl Body for SendReliable {
    const FIXED_SIZE: usize = 2;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let len = buf.get_u16() as usize;
        Ok(Self {
            data: read_data(buf, len)?,
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.data.len() as u16);
        out.put_slice(&self.data);
    }

    fn size(&self) -> usize {
        Self::FIXED_SIZE + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendUnreliable {
    pub unreliable_sequence_number: u16,
    pub data: Vec<u8>,
}

impl Body for SendUnreliable {
    const FIXED_SIZE: usize = 4;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let unreliable_sequence_number = buf.get_u16();
        let len = buf.get_u16() as usize;
        Ok(Self {
            unreliable_sequence_number,
            data: read_data(buf, len)?,
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.unreliable_sequence_number);
        out.put_u16(self.data.len() as u16);
        out.put_slice(&self.data);
    }

    fn size(&self) -> usize {
        Self::FIXED_SIZE + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendUnsequenced {
    pub unsequenced_group: u16,
    pub data: Vec<u8>,
}

impl Body for SendUnsequenced {
    const FIXED_SIZE: usize = 4;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let unsequenced_group = buf.get_u16();
        let len = buf.get_u16() as usize;
        Ok(Self {
            unsequenced_group,
            data: read_data(buf, len)?,
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.unsequenced_group);
        out.put_u16(self.data.len() as u16);
        out.put_slice(&self.data);
    }

    fn size(&self) -> usize {
        Self::FIXED_SIZE + self.data.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendFragment {
    pub start_sequence_number: u16,
    pub fragment_count: u32,
    pub fragment_number: u32,
    pub total_length: u32,
    pub fragment_offset: u32,
    pub data: Vec<u8>,
}

impl Body for SendFragment {
    const FIXED_SIZE: usize = 20;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        let start_sequence_number = buf.get_u16();
        let len = buf.get_u16() as usize;
        let fragment_count = buf.get_u32();
        let fragment_number = buf.get_u32();
        let total_length = buf.get_u32();
        let fragment_offset = buf.get_u32();
        Ok(Self {
            start_sequence_number,
            fragment_count,
            fragment_number,
            total_length,
            fragment_offset,
            data: read_data(buf, len)?,
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u16(self.start_sequence_number);
        out.put_u16(self.data.len() as u16);
        out.put_u32(self.fragment_count);
        out.put_u32(self.fragment_number);
        out.put_u32(self.total_length);
        out.put_u32(self.fragment_offset);
        out.put_slice(&self.data);
    }

    fn size(&self) -> usize {
        Self::FIXED_SIZE + self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    pub incoming_bandwidth: u32,
    pub outgoing_bandwidth: u32,
}

impl Body for BandwidthLimit {
    const FIXED_SIZE: usize = 8;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            incoming_bandwidth: buf.get_u32(),
            outgoing_bandwidth: buf.get_u32(),
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.incoming_bandwidth);
        out.put_u32(self.outgoing_bandwidth);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfigure {
    pub packet_throttle_interval: u32,
    pub packet_throttle_acceleration: u32,
    pub packet_throttle_deceleration: u32,
}

impl Body for ThrottleConfigure {
    const FIXED_SIZE: usize = 12;

    fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(Self {
            packet_throttle_interval: buf.get_u32(),
            packet_throttle_acceleration: buf.get_u32(),
            packet_throttle_deceleration: buf.get_u32(),
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u32(self.packet_throttle_interval);
        out.put_u32(self.packet_throttle_acceleration);
        out.put_u32(self.packet_throttle_deceleration);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandBody {
    Acknowledge(Acknowledge),
    Connect(Connect),
    VerifyConnect(VerifyConnect),
    Disconnect(Disconnect),
    Ping,
    SendReliable(SendReliable),
    SendUnreliable(SendUnreliable),
    SendFragment(SendFragment),
    SendUnsequenced(SendUnsequenced),
    BandwidthLimit(BandwidthLimit),
    ThrottleConfigure(ThrottleConfigure),
}

fn read_body<T: Body>(buf: &mut &[u8]) -> Result<T, WireError> {
    ensure(buf, T::FIXED_SIZE)?;
    T::read(buf)
}

impl CommandBody {
    pub fn id(&self) -> CommandId {
        match self {
            Self::Acknowledge(_) => CommandId::Acknowledge,
            Self::Connect(_) => CommandId::Connect,
            Self::VerifyConnect(_) => CommandId::VerifyConnect,
            Self::Disconnect(_) => CommandId::Disconnect,
            Self::Ping => CommandId::Ping,
            Self::SendReliable(_) => CommandId::SendReliable,
            Self::SendUnreliable(_) => CommandId::SendUnreliable,
            Self::SendFragment(_) => CommandId::SendFragment,
            Self::SendUnsequenced(_) => CommandId::SendUnsequenced,
            Self::BandwidthLimit(_) => CommandId::BandwidthLimit,
            Self::ThrottleConfigure(_) => CommandId::ThrottleConfigure,
        }
    }

    fn read(id: CommandId, buf: &mut &[u8]) -> Result<Self, WireError> {
        Ok(match id {
            CommandId::Acknowledge => Self::Acknowledge(read_body(buf)?),
            CommandId::Connect => Self::Connect(read_body(buf)?),
            CommandId::VerifyConnect => Self::VerifyConnect(read_body(buf)?),
            CommandId::Disconnect => Self::Disconnect(read_body(buf)?),
            CommandId::Ping => Self::Ping,
            CommandId::SendReliable => Self::SendReliable(read_body(buf)?),
            CommandId::SendUnreliable => Self::SendUnreliable(read_body(buf)?),
            CommandId::SendFragment => Self::SendFragment(read_body(buf)?),
            CommandId::SendUnsequenced => Self::SendUnsequenced(read_body(buf)?),
            CommandId::BandwidthLimit => Self::BandwidthLimit(read_body(buf)?),
            CommandId::ThrottleConfigure => Self::ThrottleConfigure(read_body(buf)?),
        })
    }

    fn write<B: BufMut>(&self, out: &mut B) {
        match self {
            Self::Acknowledge(body) => body.write(out),
            Self::Connect(body) => body.write(out),
            Self::VerifyConnect(body) => body.write(out),
            Self::Disconnect(body) => body.write(out),
            Self::Ping => {}
            Self::SendReliable(body) => body.write(out),
            Self::SendUnreliable(body) => body.write(out),
            Self::SendFragment(body) => body.write(out),
            Self::SendUnsequenced(body) => body.write(out),
            Self::BandwidthLimit(body) => body.write(out),
            Self::ThrottleConfigure(body) => body.write(out),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Acknowledge(body) => body.size(),
            Self::Connect(body) => body.size(),
            Self::VerifyConnect(body) => body.size(),
            Self::Disconnect(body) => body.size(),
            Self::Ping => 0,
            Self::SendReliable(body) => body.size(),
            Self::SendUnreliable(body) => body.size(),
            Self::SendFragment(body) => body.size(),
            Self::SendUnsequenced(body) => body.size(),
            Self::BandwidthLimit(body) => body.size(),
            Self::ThrottleConfigure(body) => body.size(),
        }
    }

    /// Application bytes carried by the Send* variants.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::SendReliable(body) => Some(&body.data),
            Self::SendUnreliable(body) => Some(&body.data),
            Self::SendFragment(body) => Some(&body.data),
            Self::SendUnsequenced(body) => Some(&body.data),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// High-nibble flags, see [`flags`].
    pub flags: u8,
    pub channel_id: u8,
    pub reliable_sequence_number: u16,
    pub body: CommandBody,
}

impl Command {
    pub fn new(flags: u8, channel_id: u8, reliable_sequence_number: u16, body: CommandBody) -> Self {
        Self {
            flags: flags & 0xF0,
            channel_id,
            reliable_sequence_number,
            body,
        }
    }

    pub fn id(&self) -> CommandId {
        self.body.id()
    }

    pub fn wants_acknowledge(&self) -> bool {
        self.flags & flags::ACKNOWLEDGE != 0
    }

    /// Read one command, advancing `buf` past it.
    pub fn read(buf: &mut &[u8]) -> Result<Self, WireError> {
        ensure(buf, COMMAND_HEADER_SIZE)?;
        let first = buf.get_u8();
        let id = CommandId::try_from(first & 0x0F)?;
        let channel_id = buf.get_u8();
        let reliable_sequence_number = buf.get_u16();
        let body = CommandBody::read(id, buf)?;
        Ok(Self {
            flags: first & 0xF0,
            channel_id,
            reliable_sequence_number,
            body,
        })
    }

    /// Write the command. Payloads must already fit [`MAX_PAYLOAD`], see
    /// [`Command::check_payload`].
    pub fn write<B: BufMut>(&self, out: &mut B) {
        out.put_u8((self.flags & 0xF0) | self.body.id() as u8);
        out.put_u8(self.channel_id);
        out.put_u16(self.reliable_sequence_number);
        self.body.write(out);
    }

    pub fn size(&self) -> usize {
        COMMAND_HEADER_SIZE + self.body.size()
    }

    /// Reject payloads whose length would not survive the `u16` length field.
    pub fn check_payload(data: &[u8]) -> Result<(), WireError> {
        if data.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(data.len()));
        }
        Ok(())
    }
}
