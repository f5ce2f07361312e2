use loopbridge_enet::WrappedPacket;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Application packets in the order the sending program emitted them.
    Packets {
        /// Synchronized clock reading (ms since epoch) at the sender.
        sent_at: Option<i64>,
        packets: Vec<WrappedPacket>,
    },
    /// The sending side is tearing the route down.
    Goodbye,
}

impl RelayFrame {
    pub fn packets(sent_at: Option<i64>, packets: Vec<WrappedPacket>) -> Self {
        Self::Packets { sent_at, packets }
    }
}
