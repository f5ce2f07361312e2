//! Per-datagram header.

use bytes::{Buf, BufMut};

use crate::version::ProtocolVersion;
use crate::{ensure, WireError};

/// Envelope preceding the commands of one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub session_id: u32,
    pub peer_id: u16,
    /// Low 16 bits of the sender's clock in milliseconds, when present.
    pub time_sent: Option<u16>,
}

impl Header {
    /// Read a header, advancing `buf` past it. Checksum bytes are skipped.
    pub fn read(buf: &mut &[u8], version: ProtocolVersion) -> Result<Self, WireError> {
        ensure(buf, version.base_header_size())?;
        buf.advance(version.checksum_size);

        let (session_id, raw_peer_id) = if version.is_compact() {
            (u32::from(buf.get_u8()), u16::from(buf.get_u8()))
        } else {
            (buf.get_u32(), buf.get_u16())
        };

        let time_sent = if raw_peer_id & version.sent_time_flag() != 0 {
            ensure(buf, 2)?;
            Some(buf.get_u16())
        } else {
            None
        };

        Ok(Self {
            session_id,
            peer_id: raw_peer_id & version.max_peer_id,
            time_sent,
        })
    }

    /// Write the header. Checksum bytes are written as zero.
    pub fn write<B: BufMut>(&self, out: &mut B, version: ProtocolVersion) {
        out.put_bytes(0, version.checksum_size);

        let mut raw_peer_id = self.peer_id & version.max_peer_id;
        if self.time_sent.is_some() {
            raw_peer_id |= version.sent_time_flag();
        }

        if version.is_compact() {
            out.put_u8(self.session_id as u8);
            out.put_u8(raw_peer_id as u8);
        } else {
            out.put_u32(self.session_id);
            out.put_u16(raw_peer_id);
        }

        if let Some(time_sent) = self.time_sent {
            out.put_u16(time_sent);
        }
    }

    pub fn size(&self, version: ProtocolVersion) -> usize {
        version.base_header_size() + if self.time_sent.is_some() { 2 } else { 0 }
    }
}
