//! Client role: the local game client talks to a loopback socket; its
//! traffic goes to one remote server peer. Server traffic is held back until
//! `sent_at + delay`.

use std::net::SocketAddr;

use async_trait::async_trait;
use libp2p::PeerId;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use loopbridge_protocol::RelayFrame;

use super::{ProgramLink, ProxyBase, ProxyError, ProxyEvent, RouteContext, TunnelProxy, DELIVERY_QUEUE};
use crate::config::Role;
use crate::leg::ProgramSocket;
use crate::transport::TransportSocket;

pub struct ClientProxy {
    base: ProxyBase,
    server_peer: PeerId,
    listen: SocketAddr,
    bound: Mutex<Option<SocketAddr>>,
}

impl ClientProxy {
    pub fn new(base: ProxyBase, server_peer: PeerId, listen: SocketAddr) -> Self {
        Self {
            base,
            server_peer,
            listen,
            bound: Mutex::new(None),
        }
    }

    pub fn server_peer(&self) -> PeerId {
        self.server_peer
    }

    /// Where the game client should connect, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().await
    }
}

#[async_trait]
impl TunnelProxy for ClientProxy {
    fn base(&self) -> &ProxyBase {
        &self.base
    }

    fn role(&self) -> Role {
        Role::Client
    }

    async fn start(&self) -> Result<(), ProxyError> {
        if !self.base.begin_start() {
            return Ok(());
        }
        let peer = self.server_peer;
        let socket = match ProgramSocket::bind(self.listen).await {
            Ok(socket) => socket,
            Err(source) => {
                self.base.abort_start();
                return Err(ProxyError::Bind {
                    addr: self.listen,
                    source,
                });
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.base.abort_start();
                return Err(e.into());
            }
        };

        let ctx = self.base.ctx.clone();
        let cancel = self.base.shutdown.child_token();
        let id = ctx.routes.insert_connecting(peer, cancel.clone()).await;
        let remote = match ctx.transport.create_socket_to_remote(peer, &cancel).await {
            Ok(remote) => remote,
            Err(e) => {
                let e = ProxyError::from(e);
                ctx.failed(peer, id, &e).await;
                self.base.abort_start();
                return Err(e);
            }
        };
        *self.bound.lock().await = Some(local_addr);
        ctx.established(peer, remote.sender()).await;

        let link = ProgramLink::new(socket, ctx.legs.plain_leg(0));
        self.base.spawn(run_route(ctx, peer, id, link, remote, cancel)).await;
        tracing::info!(server = %peer, listen = %local_addr, "proxy: client started");
        Ok(())
    }
}

async fn run_route(
    ctx: RouteContext,
    peer: PeerId,
    id: u64,
    mut link: ProgramLink,
    mut remote: TransportSocket,
    cancel: CancellationToken,
) {
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
                    tracing::info!(%peer, "route: server went away");
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
                        tracing::info!(%peer, "route: game client disconnected");
                        break;
                    }
                }
                Err(e) => tracing::warn!(%peer, "route: client socket error: {e}"),
            },
        }
    }

    link.close().await;
    remote.close();
    ctx.routes.remove_if_current(&peer, id).await;
    tracing::debug!(%peer, "route: torn down");
}
