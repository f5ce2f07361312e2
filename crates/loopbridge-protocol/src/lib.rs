//! loopbridge Protocol -- what travels between two tunnel endpoints.
//!
//! One reliable ordered byte stream per remote participant, opened under
//! [`TUNNEL_PROTOCOL`]. 4-byte big-endian length prefix + bincode
//! [`RelayFrame`].

pub mod codec;
pub mod frame;

pub use codec::{RelayCodec, MAX_FRAME_SIZE};
pub use frame::RelayFrame;

/// Stream protocol tag under which tunnel streams are opened.
pub const TUNNEL_PROTOCOL: &str = "/loopbridge/tunnel/1";

/// Identify protocol string announced by loopbridge nodes.
pub const IDENTIFY_PROTOCOL: &str = "/loopbridge/id/1";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("encode error: {0}")]
    Encode(bincode::Error),
    #[error("decode error: {0}")]
    Decode(bincode::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
