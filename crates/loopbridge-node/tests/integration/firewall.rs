//! Firewall tests -- a filtered Server node relaying an authoritative
//! process's output to a Client node's game client.

use std::net::SocketAddr;

use loopbridge_crypto::GameCipher;
use loopbridge_enet::WrappedPacket;
use loopbridge_firewall::{tags, AttackKind, UnitAttack, Waypoint, WaypointEntry, WaypointGroup};
use loopbridge_node::net::MemoryHub;
use loopbridge_node::proxy::{ClientProxy, ProxyEvent, ServerProxy, TunnelProxy};

use crate::harness::{wait_event, FakeGameClient, FakeGameServer, TestNode, CIPHER_KEY};

const CHANNEL: u8 = 4;
const SENDER: u32 = 0x4000_0001;

struct Filtered {
    server: ServerProxy,
    client: ClientProxy,
    game_server: FakeGameServer,
    game_client: FakeGameClient,
    leg: SocketAddr,
    cipher: GameCipher,
}

impl Filtered {
    fn seal(&self, plain: &[u8]) -> WrappedPacket {
        WrappedPacket::new(CHANNEL, self.cipher.encrypt(plain))
    }

    /// Game server output on the filtered leg.
    async fn emit(&mut self, plain: &[u8]) {
        let packet = self.seal(plain);
        let leg = self.leg;
        self.game_server.send(leg, &[packet]).await;
    }

    /// Next message the firewall handed back to the game server, decrypted.
    async fn answer(&mut self) -> Vec<u8> {
        let (from, packets) = self.game_server.recv_packets().await;
        assert_eq!(from, self.leg);
        assert_eq!(packets.len(), 1);
        self.cipher.decrypt(&packets[0].data)
    }

    /// Next message that made it across to the game client, decrypted.
    async fn relayed(&mut self) -> Vec<u8> {
        let packets = self.game_client.recv_packets().await;
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].channel_id, CHANNEL);
        self.cipher.decrypt(&packets[0].data)
    }

    async fn stop(self) {
        self.client.stop().await;
        self.server.stop().await;
    }
}

async fn filtered_pair() -> Filtered {
    let hub = MemoryHub::new();
    let server_node = TestNode::with_firewall(&hub);
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
    Filtered {
        server,
        client,
        game_server,
        game_client,
        leg,
        cipher: GameCipher::from_base64(CIPHER_KEY).unwrap(),
    }
}

fn marker() -> Vec<u8> {
    let mut message = vec![0x44];
    message.extend_from_slice(&SENDER.to_le_bytes());
    message.extend_from_slice(b"marker!!");
    message
}

fn movement(sync_id: i32, points: &[(i16, i16)]) -> Vec<u8> {
    WaypointGroup {
        sender: SENDER,
        sync_id,
        entries: vec![WaypointEntry {
            unit_net_id: 7,
            teleport_id: 0,
            waypoints: points.iter().map(|&(x, y)| Waypoint { x, y }).collect(),
        }],
    }
    .encode()
}

#[tokio::test]
async fn test_echo_answered_on_server_node() {
    let mut pair = filtered_pair().await;

    for (echo, ack) in [
        (tags::SYNC_SIM_TIME, tags::SYNC_SIM_TIME_ACK),
        (tags::PING_LOAD_INFO, tags::PING_LOAD_INFO_ACK),
    ] {
        let mut message = vec![echo];
        message.extend_from_slice(&SENDER.to_le_bytes());
        message.extend_from_slice(&[0x10, 0x20, 0x30, 0x40]);
        pair.emit(&message).await;

        let answer = pair.answer().await;
        assert_eq!(answer[0], ack);
        assert_eq!(&answer[1..], &message[1..]);
    }

    // Neither echo crossed the tunnel: the first thing the client sees is
    // what was sent after them.
    pair.emit(&marker()).await;
    assert_eq!(pair.relayed().await, marker());

    pair.stop().await;
}

#[tokio::test]
async fn test_redundant_movement_suppressed_but_acked() {
    let mut pair = filtered_pair().await;

    let first = movement(1, &[(0, 0), (10, 0), (20, 0)]);
    pair.emit(&first).await;
    let ack = pair.answer().await;
    assert_eq!(ack[0], tags::WAYPOINT_ACK);
    assert_eq!(&ack[5..9], &1i32.to_le_bytes());

    // Same path, unit a little further along it.
    pair.emit(&movement(2, &[(5, 0), (10, 0), (20, 0)])).await;
    let ack = pair.answer().await;
    assert_eq!(ack[0], tags::WAYPOINT_ACK);
    assert_eq!(&ack[5..9], &2i32.to_le_bytes());
    assert_eq!(&ack[9..11], &1u16.to_le_bytes());

    pair.emit(&marker()).await;
    assert_eq!(pair.relayed().await, first);
    assert_eq!(pair.relayed().await, marker());

    pair.stop().await;
}

#[tokio::test]
async fn test_stop_attack_for_idle_unit_not_relayed() {
    let mut pair = filtered_pair().await;
    let attack = |kind| {
        UnitAttack {
            sender: SENDER,
            unit_net_id: 42,
            kind,
            target_net_id: 9,
        }
        .encode()
    };

    pair.emit(&attack(AttackKind::Stop)).await;
    pair.emit(&attack(AttackKind::Start)).await;
    pair.emit(&attack(AttackKind::Stop)).await;

    assert_eq!(pair.relayed().await, attack(AttackKind::Start));
    assert_eq!(pair.relayed().await, attack(AttackKind::Stop));

    pair.stop().await;
}
