//! Route table -- registry of remote participants a proxy serves.
//!
//! Maps PeerId → RouteHandle (metadata plus the handles other tasks need).
//! Each route task owns its sockets and sessions; this table only tracks
//! state, the route's cancel token and, once established, its sender.

use libp2p::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::transport::TransportSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteState {
    Connecting,
    Established,
}

#[derive(Clone)]
pub struct RouteHandle {
    /// Distinguishes a route from a later one to the same peer.
    pub id: u64,
    pub peer: PeerId,
    pub state: RouteState,
    /// Cancels this route alone; a child of the proxy's shutdown token.
    pub cancel: CancellationToken,
    pub sender: Option<TransportSender>,
    pub established_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Clone, Default)]
pub struct RouteTable {
    inner: Arc<RwLock<HashMap<PeerId, RouteHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route whose setup is starting. Replaces (and cancels) any
    /// previous route to the same peer. Returns the new route's id.
    pub async fn insert_connecting(&self, peer: PeerId, cancel: CancellationToken) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = RouteHandle {
            id,
            peer,
            state: RouteState::Connecting,
            cancel,
            sender: None,
            established_at: None,
        };
        let (previous, table_size) = {
            let mut table = self.inner.write().await;
            let previous = table.insert(peer, handle);
            (previous, table.len())
        };
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }
        tracing::debug!(%peer, table_size, "routes: route added");
        id
    }

    pub async fn mark_established(&self, peer: &PeerId, sender: TransportSender) -> bool {
        let mut table = self.inner.write().await;
        let Some(handle) = table.get_mut(peer) else {
            return false;
        };
        handle.state = RouteState::Established;
        handle.sender = Some(sender);
        handle.established_at = Some(chrono::Utc::now());
        tracing::info!(%peer, "routes: route established");
        true
    }

    /// Remove `peer`'s route if it is still route `id`.
    pub async fn remove_if_current(&self, peer: &PeerId, id: u64) -> bool {
        let mut table = self.inner.write().await;
        let current = table.get(peer).is_some_and(|handle| handle.id == id);
        if current {
            table.remove(peer);
            tracing::debug!(%peer, table_size = table.len(), "routes: route removed");
        }
        current
    }

    pub async fn remove(&self, peer: &PeerId) -> Option<RouteHandle> {
        let mut table = self.inner.write().await;
        let removed = table.remove(peer);
        if removed.is_some() {
            tracing::debug!(%peer, table_size = table.len(), "routes: route removed");
        }
        removed
    }

    pub async fn get(&self, peer: &PeerId) -> Option<RouteHandle> {
        self.inner.read().await.get(peer).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        self.inner.read().await.keys().copied().collect()
    }

    /// Senders of every established route, for fan-out.
    pub async fn senders(&self) -> Vec<TransportSender> {
        self.inner
            .read()
            .await
            .values()
            .filter_map(|handle| handle.sender.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Count routes by state: (connecting, established).
    pub async fn count_by_state(&self) -> (usize, usize) {
        let table = self.inner.read().await;
        let established = table
            .values()
            .filter(|h| h.state == RouteState::Established)
            .count();
        (table.len() - established, established)
    }

    /// Remove every route, cancelling each.
    pub async fn cancel_all(&self) -> usize {
        let drained: Vec<RouteHandle> = self.inner.write().await.drain().map(|(_, h)| h).collect();
        for handle in &drained {
            handle.cancel.cancel();
        }
        drained.len()
    }
}
