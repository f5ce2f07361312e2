//! Lifecycle tests -- start/stop semantics, setup failures, and a client
//! attached to its own node's server.

use loopbridge_enet::WrappedPacket;
use loopbridge_node::net::{random_peer_id, MemoryHub};
use loopbridge_node::proxy::{ProxyError, ProxyEvent, TunnelProxy};
use loopbridge_node::transport::TransportError;

use crate::harness::{wait_event, FakeGameClient, FakeGameServer, TestNode};

#[tokio::test]
async fn test_start_twice_is_harmless() {
    let hub = MemoryHub::new();
    let server_node = TestNode::new(&hub);
    let client_node = TestNode::new(&hub);
    let game_server = FakeGameServer::bind().await;

    let server = server_node.server(game_server.addr(), vec![client_node.peer_id]);
    server.start().await.unwrap();
    server.start().await.unwrap();
    assert_eq!(server.base().routes().len().await, 1);

    let client = client_node.client(server_node.peer_id);
    client.start().await.unwrap();
    let addr = client.local_addr().await;
    client.start().await.unwrap();
    assert_eq!(client.local_addr().await, addr);
    assert_eq!(client_node.transport.open_channels().await, 1);

    client.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn test_stop_from_any_state() {
    let hub = MemoryHub::new();
    let node = TestNode::new(&hub);
    let game_server = FakeGameServer::bind().await;

    // Never started.
    let idle = node.server(game_server.addr(), vec![random_peer_id()]);
    let mut events = idle.subscribe();
    idle.stop().await;
    assert_eq!(events.recv().await.unwrap(), ProxyEvent::Stopped);

    // Routes still waiting for participants that never come.
    let waiting = node.server(game_server.addr(), vec![random_peer_id(), random_peer_id()]);
    let mut events = waiting.subscribe();
    waiting.start().await.unwrap();
    assert_eq!(waiting.base().routes().count_by_state().await, (2, 0));
    waiting.stop().await;
    waiting.stop().await;
    assert_eq!(
        wait_event(&mut events, |_| true).await.unwrap(),
        ProxyEvent::Stopped
    );
    assert!(waiting.base().routes().is_empty().await);

    // A stopped proxy does not come back.
    waiting.start().await.unwrap();
    assert!(waiting.base().routes().is_empty().await);
}

#[tokio::test]
async fn test_client_dial_failure_is_reported() {
    let hub = MemoryHub::new();
    let node = TestNode::new(&hub);
    let absent = random_peer_id();

    let client = node.client(absent);
    let mut events = client.subscribe();
    let result = client.start().await;

    assert!(matches!(
        result,
        Err(ProxyError::Transport(TransportError::Dial { .. }))
    ));
    match wait_event(&mut events, |_| true).await.unwrap() {
        ProxyEvent::RouteFailed { peer, .. } => {
            assert_eq!(peer, absent);
            assert_eq!(peer, client.server_peer());
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(client.base().routes().is_empty().await);
    assert_eq!(client.local_addr().await, None);
}

#[tokio::test]
async fn test_client_bind_failure() {
    let hub = MemoryHub::new();
    let node = TestNode::new(&hub);
    let taken = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let client = node.client_at(random_peer_id(), taken.local_addr().unwrap());
    assert!(matches!(client.start().await, Err(ProxyError::Bind { .. })));
    assert!(client.base().routes().is_empty().await);
}

#[tokio::test]
async fn test_disconnect_single_participant() {
    let hub = MemoryHub::new();
    let node = TestNode::new(&hub);
    let game_server = FakeGameServer::bind().await;
    let (kept, dropped) = (random_peer_id(), random_peer_id());

    let server = node.server(game_server.addr(), vec![kept, dropped]);
    server.start().await.unwrap();

    assert!(server.disconnect(&dropped).await);
    assert!(!server.disconnect(&dropped).await);
    assert_eq!(server.base().routes().peers().await, vec![kept]);

    server.stop().await;
}

#[tokio::test]
async fn test_client_on_same_node_as_server() {
    let hub = MemoryHub::new();
    let node = TestNode::new(&hub);
    let mut game_server = FakeGameServer::bind().await;

    let server = node.server(game_server.addr(), vec![node.peer_id]);
    let client = node.client(node.peer_id);
    let mut events = server.subscribe();
    server.start().await.unwrap();
    client.start().await.unwrap();
    wait_event(&mut events, |e| matches!(e, ProxyEvent::RouteEstablished { .. }))
        .await
        .unwrap();

    let leg = game_server.accept().await;
    let mut game_client = FakeGameClient::connect(client.local_addr().await.unwrap()).await;

    game_client.send_reliable(3, b"local").await;
    let (from, packets) = game_server.recv_packets().await;
    assert_eq!(from, leg);
    assert_eq!(packets, vec![WrappedPacket::new(3, b"local".to_vec())]);

    game_server.send(leg, &[WrappedPacket::new(3, b"back".to_vec())]).await;
    assert_eq!(
        game_client.recv_packets().await,
        vec![WrappedPacket::new(3, b"back".to_vec())]
    );

    client.stop().await;
    server.stop().await;
}
