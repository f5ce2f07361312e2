//! Header layout descriptors for the ENet revisions the game speaks.

/// Describes how a datagram header is laid out for one ENet revision.
///
/// The peer-id width decides everything else: a 7-bit peer id comes with a
/// one-byte session id and no checksum, a 15-bit peer id with a four-byte
/// session id and a four-byte checksum slot. In both forms the top bit of the
/// peer-id field flags a trailing two-byte sent time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub max_peer_id: u16,
    pub checksum_size: usize,
}

impl ProtocolVersion {
    /// Short header: `sessionId u8 | peerId u8 | [sentTime u16]`.
    pub const COMPACT: ProtocolVersion = ProtocolVersion {
        max_peer_id: 0x7F,
        checksum_size: 0,
    };

    /// Long header: `checksum u32 | sessionId u32 | peerId u16 | [sentTime u16]`.
    pub const EXTENDED: ProtocolVersion = ProtocolVersion {
        max_peer_id: 0x7FFF,
        checksum_size: 4,
    };

    pub const fn is_compact(&self) -> bool {
        self.max_peer_id <= 0x7F
    }

    /// Header bytes before the optional sent time.
    pub const fn base_header_size(&self) -> usize {
        self.checksum_size + if self.is_compact() { 2 } else { 6 }
    }

    /// Bit in the raw peer-id field that announces a sent time.
    pub const fn sent_time_flag(&self) -> u16 {
        if self.is_compact() {
            0x80
        } else {
            0x8000
        }
    }

    /// Largest session id the header can carry.
    pub const fn max_session_id(&self) -> u32 {
        if self.is_compact() {
            0xFF
        } else {
            u32::MAX
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::COMPACT
    }
}
