//! ClientServer role: every node runs its own authoritative process and its
//! own game client.
//!
//! The local client's input is stamped once and fanned out to every
//! participant's node, including this one. Each node feeds that input into
//! its authoritative process through a dedicated connection per participant,
//! delayed so it lands at `sent_at + delay` everywhere. What the process
//! sends back to the local participant's connection is passed to the local
//! client verbatim; output for remote participants stays on this node.

use std::net::SocketAddr;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use loopbridge_protocol::RelayFrame;

use super::{ProgramLink, ProxyBase, ProxyError, ProxyEvent, RouteContext, TunnelProxy, DELIVERY_QUEUE};
use crate::config::Role;
use crate::leg::ProgramSocket;

/// ENet peer id of the local participant's connection to the process.
const LOCAL_LEG: u16 = 0;

pub struct ClientServerProxy {
    base: ProxyBase,
    game_server: SocketAddr,
    listen: SocketAddr,
    participants: Vec<PeerId>,
    bound: Mutex<Option<SocketAddr>>,
}

impl ClientServerProxy {
    /// `participants` are the remote nodes; the local one is implied.
    pub fn new(
        base: ProxyBase,
        game_server: SocketAddr,
        listen: SocketAddr,
        participants: Vec<PeerId>,
    ) -> Self {
        Self {
            base,
            game_server,
            listen,
            participants,
            bound: Mutex::new(None),
        }
    }

    pub fn participants(&self) -> &[PeerId] {
        &self.participants
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().await
    }

    async fn open_local(&self) -> Result<(ProgramSocket, ProgramSocket), ProxyError> {
        let client = ProgramSocket::bind(self.listen)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: self.listen,
                source,
            })?;
        let process = ProgramSocket::connect(self.game_server).await?;
        *self.bound.lock().await = Some(client.local_addr()?);
        Ok((client, process))
    }
}

#[async_trait]
impl TunnelProxy for ClientServerProxy {
    fn base(&self) -> &ProxyBase {
        &self.base
    }

    fn role(&self) -> Role {
        Role::ClientServer
    }

    async fn start(&self) -> Result<(), ProxyError> {
        if !self.base.begin_start() {
            return Ok(());
        }
        let (client, process) = match self.open_local().await {
            Ok(sockets) => sockets,
            Err(e) => {
                self.base.abort_start();
                return Err(e);
            }
        };
        if let Err(e) = self.base.ctx.transport.create_main_socket_to_remote().await {
            self.base.abort_start();
            return Err(e.into());
        }

        let ctx = self.base.ctx.clone();
        let client = ProgramLink::new(client, ctx.legs.plain_leg(LOCAL_LEG));
        let process = ProgramLink::new(process, ctx.legs.plain_leg(LOCAL_LEG));
        self.base
            .spawn(run_local(ctx, client, process, self.base.shutdown.child_token()))
            .await;

        for (index, peer) in self.participants.iter().copied().enumerate() {
            let cancel = self.base.shutdown.child_token();
            let id = self.base.ctx.routes.insert_connecting(peer, cancel.clone()).await;
            let ctx = self.base.ctx.clone();
            let leg_id = index as u16 + 1;
            let game_server = self.game_server;
            self.base
                .spawn(run_remote(ctx, peer, id, leg_id, game_server, cancel))
                .await;
        }
        tracing::info!(
            participants = self.participants.len(),
            game_server = %self.game_server,
            listen = %self.listen,
            "proxy: client-server started"
        );
        Ok(())
    }
}

/// The local participant: game client on one side, its connection into the
/// local process on the other.
async fn run_local(
    ctx: RouteContext,
    mut client: ProgramLink,
    mut process: ProgramLink,
    cancel: CancellationToken,
) {
    let (deliveries, mut due) = mpsc::channel(DELIVERY_QUEUE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(packets) = due.recv() => process.deliver(packets).await,
            received = client.recv() => match received {
                Ok(len) => {
                    let was_connected = client.session().is_connected();
                    let ingested = client.ingest(len).await;
                    if !was_connected && client.session().is_connected() {
                        // Mirror the client's session so the process's replies
                        // can be handed to it untouched.
                        let session = client.session();
                        let (session_id, peer_id) = (session.session_id(), session.remote_peer_id());
                        if let Err(e) = process.connect_as(session_id, peer_id).await {
                            tracing::warn!("route: local participant connect failed: {e}");
                        }
                    }
                    if !ingested.packets.is_empty() {
                        let sent_at = ctx.now_ms();
                        let frame = RelayFrame::packets(Some(sent_at), ingested.packets.clone());
                        for sender in ctx.routes.senders().await {
                            sender.send(frame.clone());
                        }
                        ctx.schedule_delivery(Some(sent_at), ingested.packets, &deliveries);
                    }
                    if ingested.disconnected {
                        tracing::info!("route: local game client disconnected");
                        client.reset(ctx.legs.plain_leg(LOCAL_LEG)).await;
                        process.reset(ctx.legs.plain_leg(LOCAL_LEG)).await;
                    }
                }
                Err(e) => tracing::warn!("route: client socket error: {e}"),
            },
            received = process.recv() => match received {
                Ok(len) => {
                    let was_connected = process.session().is_connected();
                    let ingested = process.ingest(len).await;
                    if was_connected {
                        client.send_raw(process.datagram(len)).await;
                    }
                    if ingested.disconnected {
                        tracing::info!("route: game server dropped local participant");
                        client.reset(ctx.legs.plain_leg(LOCAL_LEG)).await;
                        process.reset(ctx.legs.plain_leg(LOCAL_LEG)).await;
                    }
                }
                Err(e) => tracing::warn!("route: program socket error: {e}"),
            },
        }
    }

    process.close().await;
    client.close().await;
    tracing::debug!("route: local participant torn down");
}

/// A remote participant: its input, once due, goes into the local process.
async fn run_remote(
    ctx: RouteContext,
    peer: PeerId,
    id: u64,
    leg_id: u16,
    game_server: SocketAddr,
    cancel: CancellationToken,
) {
    let leg = ctx.legs.program_leg(leg_id);
    let (mut link, mut remote) = match ctx.open_program_route(peer, leg, game_server, &cancel).await {
        Ok(opened) => opened,
        Err(e) => {
            ctx.failed(peer, id, &e).await;
            return;
        }
    };
    ctx.established(peer, remote.sender()).await;
    let (deliveries, mut due) = mpsc::channel(DELIVERY_QUEUE);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(packets) = due.recv() => link.deliver(packets).await,
            frame = remote.recv() => match frame {
                Some(RelayFrame::Packets { sent_at, packets }) => {
                    ctx.schedule_delivery(sent_at, packets, &deliveries);
                }
                Some(RelayFrame::Goodbye) | None => {
                    tracing::info!(%peer, "route: participant left");
                    ctx.emit(ProxyEvent::PeerDisconnected { peer });
                    break;
                }
            },
            received = link.recv() => match received {
                Ok(len) => {
                    // Replies are answered by the link; output for a remote
                    // participant is its own node's business.
                    let ingested = link.ingest(len).await;
                    if ingested.disconnected {
                        tracing::info!(%peer, "route: game server dropped participant");
                        break;
                    }
                }
                Err(e) => tracing::warn!(%peer, "route: program socket error: {e}"),
            },
        }
    }

    link.close().await;
    remote.close();
    ctx.routes.remove_if_current(&peer, id).await;
    tracing::debug!(%peer, "route: torn down");
}
