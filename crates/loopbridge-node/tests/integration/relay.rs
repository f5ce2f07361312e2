//! Relay tests -- a Client and a Server node carrying game traffic between
//! their game processes.

use std::time::Duration;

use loopbridge_enet::WrappedPacket;
use loopbridge_node::net::MemoryHub;
use loopbridge_node::proxy::{ClientProxy, ProxyEvent, ServerProxy, TunnelProxy};
use tokio::time::Instant;

use crate::harness::{
    wait_event, FakeGameClient, FakeGameServer, TestNode, DELAY_MS, SLACK, TICK,
};

struct Pair {
    server: ServerProxy,
    client: ClientProxy,
    game_server: FakeGameServer,
    game_client: FakeGameClient,
    /// The server proxy's connection into the game server.
    leg: std::net::SocketAddr,
}

/// Server node and client node, both proxies started, both game processes
/// connected.
async fn connected_pair() -> Pair {
    let hub = MemoryHub::new();
    let server_node = TestNode::new(&hub);
    let client_node = TestNode::new(&hub);
    let mut game_server = FakeGameServer::bind().await;

    let server = server_node.server(game_server.addr(), vec![client_node.peer_id]);
    let client = client_node.client(server_node.peer_id);
    let mut events = server.subscribe();
    server.start().await.unwrap();
    client.start().await.unwrap();

    wait_event(&mut events, |e| matches!(e, ProxyEvent::RouteEstablished { .. }))
        .await
        .unwrap();
    let leg = game_server.accept().await;
    let game_client = FakeGameClient::connect(client.local_addr().await.unwrap()).await;

    Pair {
        server,
        client,
        game_server,
        game_client,
        leg,
    }
}

#[tokio::test]
async fn test_client_payload_reaches_game_server() {
    let mut pair = connected_pair().await;

    let started = Instant::now();
    pair.game_client.send_reliable(1, &[0xAA, 0xBB]).await;
    let (from, packets) = pair.game_server.recv_packets().await;

    assert_eq!(from, pair.leg);
    assert_eq!(packets, vec![WrappedPacket::new(1, vec![0xAA, 0xBB])]);
    // The server side applies no scheduler delay.
    assert!(
        started.elapsed() <= Duration::from_millis(DELAY_MS) + TICK + SLACK,
        "took {:?}",
        started.elapsed()
    );

    pair.client.stop().await;
    pair.server.stop().await;
}

#[tokio::test]
async fn test_server_payload_delayed_to_game_client() {
    let mut pair = connected_pair().await;
    let delay = Duration::from_millis(DELAY_MS);

    let started = Instant::now();
    let leg = pair.leg;
    pair.game_server
        .send(leg, &[WrappedPacket::new(2, vec![0xAA, 0xBB])])
        .await;
    let packets = pair.game_client.recv_packets().await;
    let elapsed = started.elapsed();

    assert_eq!(packets, vec![WrappedPacket::new(2, vec![0xAA, 0xBB])]);
    assert!(elapsed + TICK >= delay, "arrived early: {elapsed:?}");
    assert!(elapsed <= delay + TICK + SLACK, "arrived late: {elapsed:?}");

    pair.client.stop().await;
    pair.server.stop().await;
}

#[tokio::test]
async fn test_messages_keep_their_order() {
    let mut pair = connected_pair().await;

    for i in 0..5u8 {
        pair.game_client.send_reliable(1, &[i, i]).await;
    }
    let mut seen = Vec::new();
    while seen.len() < 5 {
        let (_, packets) = pair.game_server.recv_packets().await;
        seen.extend(packets.into_iter().map(|p| p.data[0]));
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    pair.client.stop().await;
    pair.server.stop().await;
}

#[tokio::test]
async fn test_client_stop_disconnects_game_server_leg() {
    let mut pair = connected_pair().await;
    let mut events = pair.server.subscribe();
    let client_peer = pair.server.participants()[0];

    pair.client.stop().await;

    let event = wait_event(&mut events, |e| matches!(e, ProxyEvent::PeerDisconnected { .. }))
        .await
        .unwrap();
    assert_eq!(event, ProxyEvent::PeerDisconnected { peer: client_peer });
    let leg = pair.leg;
    pair.game_server.wait_disconnect(leg).await;

    pair.server.stop().await;
    assert!(pair.server.base().routes().is_empty().await);
}

#[tokio::test]
async fn test_game_client_disconnect_ends_route() {
    let mut pair = connected_pair().await;
    let mut events = pair.server.subscribe();

    pair.game_client.disconnect().await;

    wait_event(&mut events, |e| matches!(e, ProxyEvent::PeerDisconnected { .. }))
        .await
        .unwrap();
    let leg = pair.leg;
    pair.game_server.wait_disconnect(leg).await;

    pair.client.stop().await;
    pair.server.stop().await;
}
