//! ClientServer tests -- two nodes, each running its own game server and
//! game client, fed the same input at the same delay.

use std::time::Duration;

use loopbridge_enet::WrappedPacket;
use loopbridge_node::net::MemoryHub;
use loopbridge_node::proxy::{ClientServerProxy, ProxyEvent, TunnelProxy};
use loopbridge_node::transport::{tie_break, Side};
use tokio::time::Instant;

use crate::harness::{
    wait_event, FakeGameClient, FakeGameServer, TestNode, DELAY_MS, SLACK, TICK,
};

struct Player {
    proxy: ClientServerProxy,
    game_server: FakeGameServer,
    /// Game server connection carrying the other player's input.
    remote_leg: std::net::SocketAddr,
}

/// Two client-server nodes with their route to each other established.
async fn two_players() -> (Player, Player) {
    let hub = MemoryHub::new();
    let a = TestNode::new(&hub);
    let b = TestNode::new(&hub);
    let mut game_a = FakeGameServer::bind().await;
    let mut game_b = FakeGameServer::bind().await;

    let proxy_a = a.client_server(game_a.addr(), vec![b.peer_id]);
    let proxy_b = b.client_server(game_b.addr(), vec![a.peer_id]);
    let mut events_a = proxy_a.subscribe();
    let mut events_b = proxy_b.subscribe();

    // The listening side has to accept before the dialling side dials.
    if tie_break(&a.peer_id, &b.peer_id) == Side::Dial {
        proxy_b.start().await.unwrap();
        proxy_a.start().await.unwrap();
    } else {
        proxy_a.start().await.unwrap();
        proxy_b.start().await.unwrap();
    }
    for events in [&mut events_a, &mut events_b] {
        wait_event(events, |e| matches!(e, ProxyEvent::RouteEstablished { .. }))
            .await
            .unwrap();
    }

    let remote_a = game_a.accept().await;
    let remote_b = game_b.accept().await;
    (
        Player {
            proxy: proxy_a,
            game_server: game_a,
            remote_leg: remote_a,
        },
        Player {
            proxy: proxy_b,
            game_server: game_b,
            remote_leg: remote_b,
        },
    )
}

#[tokio::test]
async fn test_input_reaches_every_game_server_at_same_delay() {
    let (mut a, mut b) = two_players().await;
    let mut client_a = FakeGameClient::connect(a.proxy.local_addr().await.unwrap()).await;
    let local_leg = a.game_server.accept().await;
    assert_ne!(local_leg, a.remote_leg);

    let started = Instant::now();
    client_a.send_reliable(1, &[0xAA, 0xBB]).await;
    let ((from_a, packets_a, elapsed_a), (from_b, packets_b, elapsed_b)) = tokio::join!(
        async {
            let (from, packets) = a.game_server.recv_packets().await;
            (from, packets, started.elapsed())
        },
        async {
            let (from, packets) = b.game_server.recv_packets().await;
            (from, packets, started.elapsed())
        },
    );

    let expected = vec![WrappedPacket::new(1, vec![0xAA, 0xBB])];
    assert_eq!((from_a, packets_a), (local_leg, expected.clone()));
    assert_eq!((from_b, packets_b), (b.remote_leg, expected));

    let delay = Duration::from_millis(DELAY_MS);
    for elapsed in [elapsed_a, elapsed_b] {
        assert!(elapsed + TICK >= delay, "arrived early: {elapsed:?}");
        assert!(elapsed <= delay + TICK + SLACK, "arrived late: {elapsed:?}");
    }

    a.proxy.stop().await;
    b.proxy.stop().await;
}

#[tokio::test]
async fn test_only_local_participant_output_reaches_client() {
    let (mut a, b) = two_players().await;
    let mut client_a = FakeGameClient::connect(a.proxy.local_addr().await.unwrap()).await;
    let local_leg = a.game_server.accept().await;

    // Output for the remote participant stays on this node.
    let remote_leg = a.remote_leg;
    a.game_server
        .send(remote_leg, &[WrappedPacket::new(4, b"theirs".to_vec())])
        .await;
    a.game_server
        .send(local_leg, &[WrappedPacket::new(4, b"ours".to_vec())])
        .await;

    assert_eq!(
        client_a.recv_packets().await,
        vec![WrappedPacket::new(4, b"ours".to_vec())]
    );

    a.proxy.stop().await;
    b.proxy.stop().await;
}

#[tokio::test]
async fn test_stopping_one_node_disconnects_its_participant() {
    let (a, mut b) = two_players().await;
    let mut events_b = b.proxy.subscribe();

    a.proxy.stop().await;

    let event = wait_event(&mut events_b, |e| matches!(e, ProxyEvent::PeerDisconnected { .. }))
        .await
        .unwrap();
    assert_eq!(
        event,
        ProxyEvent::PeerDisconnected {
            peer: b.proxy.participants()[0]
        }
    );
    let remote_leg = b.remote_leg;
    b.game_server.wait_disconnect(remote_leg).await;

    b.proxy.stop().await;
}
