//! Peer-to-peer boundary: open or accept a reliable ordered byte stream to a
//! peer, keyed by peer identity under the tunnel protocol tag.
//!
//! Two implementations: [`swarm::SwarmNetwork`] over libp2p and
//! [`memory::MemoryNetwork`] over in-process pipes.

pub mod memory;
pub mod swarm;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::transport::TransportError;

pub use memory::{random_peer_id, MemoryHub, MemoryNetwork};
pub use swarm::SwarmNetwork;

/// Any bidirectional byte stream a network hands out.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Inbound streams, tagged with the peer that opened them.
pub type IncomingStreams = mpsc::Receiver<(PeerId, TunnelStream)>;

#[async_trait]
pub trait P2pNetwork: Send + Sync + 'static {
    fn local_peer_id(&self) -> PeerId;

    /// Open a new tunnel stream to `peer`, dialling it if needed.
    async fn open_stream(&self, peer: PeerId) -> Result<TunnelStream, TransportError>;

    /// Start accepting tunnel streams. Only one acceptor may exist.
    async fn accept_streams(&self) -> Result<IncomingStreams, TransportError>;
}
