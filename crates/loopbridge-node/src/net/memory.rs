//! In-process network: every stream is a tokio duplex pipe.
//!
//! Nodes created from one [`MemoryHub`] can reach each other by peer id.
//! Used by the integration tests and for pairing proxies inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::{mpsc, RwLock};

use super::{IncomingStreams, P2pNetwork, TunnelStream};
use crate::transport::TransportError;

const PIPE_CAPACITY: usize = 64 * 1024;
const ACCEPT_QUEUE: usize = 32;

type Listeners = HashMap<PeerId, mpsc::Sender<(PeerId, TunnelStream)>>;

#[derive(Clone, Default)]
pub struct MemoryHub {
    listeners: Arc<RwLock<Listeners>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new node with a random identity.
    pub fn node(&self) -> MemoryNetwork {
        self.node_with_id(random_peer_id())
    }

    pub fn node_with_id(&self, peer_id: PeerId) -> MemoryNetwork {
        MemoryNetwork {
            peer_id,
            hub: self.clone(),
        }
    }
}

/// Peer id of a throwaway Ed25519 key.
pub fn random_peer_id() -> PeerId {
    let seed: [u8; 32] = rand::random();
    match libp2p::identity::Keypair::ed25519_from_bytes(seed) {
        Ok(keypair) => keypair.public().to_peer_id(),
        Err(_) => unreachable!("any 32 bytes are a valid ed25519 seed"),
    }
}

#[derive(Clone)]
pub struct MemoryNetwork {
    peer_id: PeerId,
    hub: MemoryHub,
}

#[async_trait]
impl P2pNetwork for MemoryNetwork {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn open_stream(&self, peer: PeerId) -> Result<TunnelStream, TransportError> {
        let listener = self
            .hub
            .listeners
            .read()
            .await
            .get(&peer)
            .cloned()
            .ok_or_else(|| TransportError::Dial {
                peer,
                reason: "peer not listening".into(),
            })?;

        let (ours, theirs) = tokio::io::duplex(PIPE_CAPACITY);
        listener
            .send((self.peer_id, Box::new(theirs) as TunnelStream))
            .await
            .map_err(|_| TransportError::Dial {
                peer,
                reason: "peer stopped accepting".into(),
            })?;
        tracing::debug!(%peer, "net: memory stream opened");
        Ok(Box::new(ours))
    }

    async fn accept_streams(&self) -> Result<IncomingStreams, TransportError> {
        let mut listeners = self.hub.listeners.write().await;
        if listeners.get(&self.peer_id).is_some_and(|tx| !tx.is_closed()) {
            return Err(TransportError::AlreadyListening);
        }
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE);
        listeners.insert(self.peer_id, tx);
        Ok(rx)
    }
}
