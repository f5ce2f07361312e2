//! Transport strategy -- one framed relay channel per remote participant,
//! multiplexed over whatever [`P2pNetwork`] the node runs on.
//!
//! A channel is a tunnel stream wrapped in [`RelayCodec`] and driven by a
//! pump task. Callers never touch the stream: they push frames into a bounded
//! queue (`send` never blocks) and read frames from a broadcast feed.
//!
//! Which side opens the stream is decided per peer: a client always dials, a
//! server always listens, and two nodes that can do either compare peer ids
//! so exactly one of them dials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use libp2p::PeerId;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use loopbridge_protocol::{RelayCodec, RelayFrame};

use crate::net::{P2pNetwork, TunnelStream};

/// Frames a route may queue before `send` starts refusing.
const OUTBOUND_QUEUE: usize = 256;
/// Frames buffered per subscriber before the slowest one starts lagging.
const INBOUND_BUFFER: usize = 1024;
const LOOPBACK_PIPE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("dial {peer} failed: {reason}")]
    Dial { peer: PeerId, reason: String },
    #[error("listen failed: {0}")]
    Listen(String),
    #[error("channel closed")]
    Closed,
    #[error("aborted")]
    Aborted,
    #[error("already accepting tunnel streams")]
    AlreadyListening,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Dial,
    Listen,
}

/// How a transport decides which side it plays for a given peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialPolicy {
    DialOnly,
    ListenOnly,
    TieBreak,
}

/// The node whose base58 peer id sorts first dials.
pub fn tie_break(local: &PeerId, remote: &PeerId) -> Side {
    if local.to_base58() < remote.to_base58() {
        Side::Dial
    } else {
        Side::Listen
    }
}

struct Channel {
    id: u64,
    sender: TransportSender,
    inbound: broadcast::Sender<RelayFrame>,
}

enum Inbound {
    Ready(TunnelStream),
    Waiting(oneshot::Sender<TunnelStream>),
}

#[derive(Default)]
struct Shared {
    channels: Mutex<HashMap<(PeerId, Side), Channel>>,
    inbound: Mutex<HashMap<PeerId, Inbound>>,
    accepting: Mutex<Option<CancellationToken>>,
    next_id: AtomicU64,
}

impl Shared {
    /// Hand an inbound stream to whoever waits for `peer`, or park it.
    async fn offer(&self, peer: PeerId, stream: TunnelStream) {
        let mut inbound = self.inbound.lock().await;
        match inbound.remove(&peer) {
            Some(Inbound::Waiting(waiter)) => {
                if let Err(stream) = waiter.send(stream) {
                    inbound.insert(peer, Inbound::Ready(stream));
                }
            }
            Some(Inbound::Ready(_)) => {
                tracing::debug!(%peer, "transport: replacing unclaimed inbound stream");
                inbound.insert(peer, Inbound::Ready(stream));
            }
            None => {
                inbound.insert(peer, Inbound::Ready(stream));
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamTransport {
    network: Arc<dyn P2pNetwork>,
    policy: DialPolicy,
    shared: Arc<Shared>,
}

impl StreamTransport {
    pub fn new(network: Arc<dyn P2pNetwork>, policy: DialPolicy) -> Self {
        Self {
            network,
            policy,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Same network and channel table, different policy. Lets a client and a
    /// server proxy on one node reach each other without the network.
    pub fn with_policy(&self, policy: DialPolicy) -> Self {
        Self {
            network: self.network.clone(),
            policy,
            shared: self.shared.clone(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.network.local_peer_id()
    }

    pub fn side_for(&self, peer: &PeerId) -> Side {
        match self.policy {
            DialPolicy::DialOnly => Side::Dial,
            DialPolicy::ListenOnly => Side::Listen,
            DialPolicy::TieBreak => tie_break(&self.local_peer_id(), peer),
        }
    }

    pub async fn open_channels(&self) -> usize {
        self.shared.channels.lock().await.len()
    }

    /// Begin accepting inbound tunnel streams. No-op for dial-only
    /// transports and when already accepting.
    pub async fn create_main_socket_to_remote(&self) -> Result<(), TransportError> {
        if self.policy == DialPolicy::DialOnly {
            return Ok(());
        }
        let mut accepting = self.shared.accepting.lock().await;
        if accepting.is_some() {
            return Ok(());
        }

        let mut incoming = self.network.accept_streams().await?;
        let token = CancellationToken::new();
        let stop = token.clone();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    next = incoming.recv() => {
                        let Some((peer, stream)) = next else { break };
                        tracing::debug!(%peer, "transport: inbound stream");
                        shared.offer(peer, stream).await;
                    }
                }
            }
            tracing::debug!("transport: stopped accepting");
        });

        *accepting = Some(token);
        tracing::info!(peer_id = %self.local_peer_id(), "transport: accepting tunnel streams");
        Ok(())
    }

    /// A socket to `peer`: an existing open channel if there is one,
    /// otherwise a new stream dialled or awaited according to policy.
    pub async fn create_socket_to_remote(
        &self,
        peer: PeerId,
        cancel: &CancellationToken,
    ) -> Result<TransportSocket, TransportError> {
        let side = self.side_for(&peer);
        let key = (peer, side);

        if let Some(channel) = self.shared.channels.lock().await.get(&key) {
            if !channel.sender.is_closed() {
                tracing::debug!(%peer, ?side, "transport: reusing open channel");
                return Ok(TransportSocket {
                    sender: channel.sender.clone(),
                    inbound: channel.inbound.subscribe(),
                });
            }
        }

        let stream = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Aborted),
            stream = self.obtain(peer, side) => stream?,
        };
        Ok(self.attach(key, stream).await)
    }

    /// Stop accepting and close every channel.
    pub async fn shutdown(&self) {
        if let Some(token) = self.shared.accepting.lock().await.take() {
            token.cancel();
        }
        for channel in self.shared.channels.lock().await.values() {
            channel.sender.closed.cancel();
        }
        self.shared.inbound.lock().await.clear();
    }

    async fn obtain(&self, peer: PeerId, side: Side) -> Result<TunnelStream, TransportError> {
        match side {
            Side::Dial if peer == self.local_peer_id() => Ok(self.loopback(peer).await),
            Side::Dial => self.network.open_stream(peer).await,
            Side::Listen => self.await_inbound(peer).await,
        }
    }

    async fn loopback(&self, peer: PeerId) -> TunnelStream {
        let (ours, theirs) = tokio::io::duplex(LOOPBACK_PIPE);
        tracing::debug!(%peer, "transport: same-node channel");
        self.shared.offer(peer, Box::new(theirs)).await;
        Box::new(ours)
    }

    async fn await_inbound(&self, peer: PeerId) -> Result<TunnelStream, TransportError> {
        let waiter = {
            let mut inbound = self.shared.inbound.lock().await;
            if let Some(Inbound::Ready(stream)) = inbound.remove(&peer) {
                return Ok(stream);
            }
            let accepting = self.shared.accepting.lock().await.is_some();
            if !accepting && peer != self.local_peer_id() {
                return Err(TransportError::Listen("not accepting tunnel streams".into()));
            }
            let (tx, rx) = oneshot::channel();
            inbound.insert(peer, Inbound::Waiting(tx));
            rx
        };
        tracing::debug!(%peer, "transport: awaiting inbound stream");
        waiter.await.map_err(|_| TransportError::Closed)
    }

    async fn attach(&self, key: (PeerId, Side), stream: TunnelStream) -> TransportSocket {
        let (peer, side) = key;
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (inbound_tx, inbound_rx) = broadcast::channel(INBOUND_BUFFER);
        let sender = TransportSender {
            peer,
            outbound: outbound_tx,
            closed: CancellationToken::new(),
        };
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let previous = self.shared.channels.lock().await.insert(
            key,
            Channel {
                id,
                sender: sender.clone(),
                inbound: inbound_tx.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.sender.closed.cancel();
        }

        tracing::info!(%peer, ?side, "transport: channel open");
        let pump = Pump {
            shared: self.shared.clone(),
            key,
            id,
            closed: sender.closed.clone(),
        };
        tokio::spawn(pump.run(stream, outbound_rx, inbound_tx));

        TransportSocket {
            sender,
            inbound: inbound_rx,
        }
    }
}

struct Pump {
    shared: Arc<Shared>,
    key: (PeerId, Side),
    id: u64,
    closed: CancellationToken,
}

impl Pump {
    async fn run(
        self,
        stream: TunnelStream,
        mut outbound: mpsc::Receiver<RelayFrame>,
        inbound: broadcast::Sender<RelayFrame>,
    ) {
        let peer = self.key.0;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, RelayCodec);
        let mut writer = FramedWrite::new(write_half, RelayCodec);

        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let goodbye = frame == RelayFrame::Goodbye;
                    if let Err(e) = writer.send(frame).await {
                        tracing::warn!(%peer, "transport: write failed: {e}");
                        break;
                    }
                    if goodbye {
                        break;
                    }
                }
                frame = reader.next() => match frame {
                    Some(Ok(frame)) => {
                        let goodbye = frame == RelayFrame::Goodbye;
                        // No subscriber is not an error; the route may be restarting.
                        let _ = inbound.send(frame);
                        if goodbye {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(%peer, "transport: dropping channel on bad frame: {e}");
                        break;
                    }
                    None => {
                        tracing::debug!(%peer, "transport: remote closed stream");
                        break;
                    }
                },
            }
        }

        self.closed.cancel();
        if let Err(e) = writer.close().await {
            tracing::debug!(%peer, "transport: close: {e}");
        }

        let mut channels = self.shared.channels.lock().await;
        if channels.get(&self.key).is_some_and(|c| c.id == self.id) {
            channels.remove(&self.key);
        }
        tracing::info!(%peer, "transport: channel closed");
    }
}

/// Outbound half of a channel. Cheap to clone, so fan-out can hold one per
/// participant.
#[derive(Clone)]
pub struct TransportSender {
    peer: PeerId,
    outbound: mpsc::Sender<RelayFrame>,
    closed: CancellationToken,
}

impl TransportSender {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Queue `frame` without waiting. `false` means it was dropped.
    pub fn send(&self, frame: RelayFrame) -> bool {
        if self.closed.is_cancelled() {
            return false;
        }
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(peer = %self.peer, "transport: outbound queue full, frame dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

pub struct TransportSocket {
    sender: TransportSender,
    inbound: broadcast::Receiver<RelayFrame>,
}

impl TransportSocket {
    pub fn peer(&self) -> PeerId {
        self.sender.peer
    }

    pub fn send(&self, frame: RelayFrame) -> bool {
        self.sender.send(frame)
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    /// Next frame from the remote; `None` once the channel is gone.
    pub async fn recv(&mut self) -> Option<RelayFrame> {
        loop {
            match self.inbound.recv().await {
                Ok(frame) => return Some(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(peer = %self.sender.peer, skipped, "transport: reader lagged, frames lost");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Say goodbye and let the channel wind down after queued frames.
    pub fn close(self) {
        if self.sender.is_closed() {
            return;
        }
        if self.sender.outbound.try_send(RelayFrame::Goodbye).is_err() {
            self.sender.closed.cancel();
        }
    }
}
