//! loopbridge ENet -- wire codec and reduced per-connection state machine.
//!
//! Enough of ENet to intercept, acknowledge and re-synthesize the handshake
//! and data traffic of a game process without running a full ENet host.
//!
//! Datagram layout: one [`Header`] followed by one or more [`Command`]s,
//! all multi-byte integers big-endian.

pub mod command;
pub mod header;
pub mod packet;
pub mod peer;
pub mod version;

pub use command::{
    flags, Acknowledge, BandwidthLimit, Command, CommandBody, CommandId, Connect, Disconnect,
    SendFragment, SendReliable, SendUnreliable, SendUnsequenced, ThrottleConfigure, VerifyConnect,
    CONNECTION_CHANNEL,
};
pub use header::Header;
pub use packet::{FragmentDescriptor, WrappedPacket};
pub use peer::{Channel, Received, SessionPeer, SessionState};
pub use version::ProtocolVersion;

/// Decode failures. Any of these abandons the rest of the buffer being parsed.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated input: needed {needed} bytes, {remaining} remaining")]
    TruncatedInput { needed: usize, remaining: usize },
    #[error("unknown command id {0}")]
    UnknownCommand(u8),
    #[error("payload too large: {0} bytes (max 65535)")]
    PayloadTooLarge(usize),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("invalid session state: expected {expected:?}, was {actual:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },
}

/// Fail with [`WireError::TruncatedInput`] unless `buf` holds at least `needed` bytes.
pub(crate) fn ensure(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        return Err(WireError::TruncatedInput {
            needed,
            remaining: buf.len(),
        });
    }
    Ok(())
}

/// Parse a whole datagram strictly: header plus every command, failing on
/// the first malformed command.
pub fn decode_datagram(
    mut buf: &[u8],
    version: ProtocolVersion,
) -> Result<(Header, Vec<Command>), WireError> {
    let header = Header::read(&mut buf, version)?;
    let mut commands = Vec::new();
    while !buf.is_empty() {
        commands.push(Command::read(&mut buf)?);
    }
    Ok((header, commands))
}

/// Serialize one header followed by `commands` into a single datagram.
pub fn encode_datagram(header: &Header, commands: &[Command], version: ProtocolVersion) -> Vec<u8> {
    let body: usize = commands.iter().map(Command::size).sum();
    let mut out = Vec::with_capacity(header.size(version) + body);
    header.write(&mut out, version);
    for command in commands {
        command.write(&mut out);
    }
    out
}
