//! Server role: one route per participant into the local authoritative
//! process. Relayed packets are delivered as soon as they arrive.

use std::net::SocketAddr;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio_util::sync::CancellationToken;

use loopbridge_protocol::RelayFrame;

use super::{ProxyBase, ProxyError, ProxyEvent, RouteContext, TunnelProxy};
use crate::config::Role;

pub struct ServerProxy {
    base: ProxyBase,
    game_server: SocketAddr,
    participants: Vec<PeerId>,
}

impl ServerProxy {
    pub fn new(base: ProxyBase, game_server: SocketAddr, participants: Vec<PeerId>) -> Self {
        Self {
            base,
            game_server,
            participants,
        }
    }

    pub fn participants(&self) -> &[PeerId] {
        &self.participants
    }
}

#[async_trait]
impl TunnelProxy for ServerProxy {
    fn base(&self) -> &ProxyBase {
        &self.base
    }

    fn role(&self) -> Role {
        Role::Server
    }

    async fn start(&self) -> Result<(), ProxyError> {
        if !self.base.begin_start() {
            return Ok(());
        }
        if let Err(e) = self.base.ctx.transport.create_main_socket_to_remote().await {
            self.base.abort_start();
            return Err(e.into());
        }

        for (index, peer) in self.participants.iter().copied().enumerate() {
            let cancel = self.base.shutdown.child_token();
            let id = self.base.ctx.routes.insert_connecting(peer, cancel.clone()).await;
            let ctx = self.base.ctx.clone();
            let leg_id = index as u16;
            let game_server = self.game_server;
            self.base
                .spawn(run_route(ctx, peer, id, leg_id, game_server, cancel))
                .await;
        }
        tracing::info!(
            participants = self.participants.len(),
            game_server = %self.game_server,
            "proxy: server started"
        );
        Ok(())
    }
}

async fn run_route(
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

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = remote.recv() => match frame {
                Some(RelayFrame::Packets { packets, .. }) => link.deliver(packets).await,
                Some(RelayFrame::Goodbye) | None => {
                    tracing::info!(%peer, "route: participant left");
                    ctx.emit(ProxyEvent::PeerDisconnected { peer });
                    break;
                }
            },
            received = link.recv() => match received {
                Ok(len) => {
                    let ingested = link.ingest(len).await;
                    if !ingested.packets.is_empty() {
                        remote.send(RelayFrame::packets(Some(ctx.now_ms()), ingested.packets));
                    }
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
