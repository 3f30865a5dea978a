// Integration tests for the WebSocket relay
// Each test serves the routes in-process on an ephemeral port

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rusty_signal::auth::QueryIdentityResolver;
use rusty_signal::config::ServerConfig;
use rusty_signal::core::{ServerManager, SharedServerManager};
use rusty_signal::handlers::routes;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

fn start_server() -> (SocketAddr, SharedServerManager) {
    let server = Arc::new(ServerManager::new(ServerConfig::for_testing()));
    let (addr, serving) = warp::serve(routes(server.clone(), Arc::new(QueryIdentityResolver)))
        .bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(serving);
    (addr, server)
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Value>,
}

impl TestClient {
    async fn connect(addr: SocketAddr, user_id: u64) -> Self {
        let url = format!("ws://{}/ws?user_id={}", addr, user_id);
        let (ws, _) = connect_async(url).await.expect("Failed to connect");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("Failed to send message");
    }

    // Next envelope, splitting batched frames on newlines
    async fn recv(&mut self) -> Value {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return value;
            }
            let message = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("Timed out waiting for a message")
                .expect("Connection ended")
                .expect("Transport error");
            if let Message::Text(text) = message {
                for line in text.split('\n') {
                    self.pending
                        .push_back(serde_json::from_str(line).expect("Invalid JSON frame"));
                }
            }
        }
    }

    async fn recv_kind(&mut self, kind: &str) -> Value {
        let value = self.recv().await;
        assert_eq!(value["type"], kind, "unexpected frame: {}", value);
        value
    }

    // True once the server has closed this connection
    async fn wait_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(RECV_TIMEOUT, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

// Poll until the hub reports the given counts
async fn wait_for_counts(server: &ServerManager, connections: usize, rooms: usize) -> bool {
    for _ in 0..50 {
        if server.connection_count().await == connections && server.room_count().await == rooms {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_signaling_between_two_peers() {
    let (addr, _server) = start_server();
    let mut alice = TestClient::connect(addr, 1).await;
    let mut bob = TestClient::connect(addr, 2).await;

    alice.send(json!({"type": "join_room", "payload": {"room_id": 42}})).await;
    let joined = alice.recv_kind("user_joined").await;
    assert_eq!(joined["payload"]["user_id"], 1);

    bob.send(json!({"type": "join_room", "payload": {"room_id": 42}})).await;
    assert_eq!(alice.recv_kind("user_joined").await["payload"]["user_id"], 2);
    assert_eq!(bob.recv_kind("user_joined").await["payload"]["user_id"], 2);

    alice
        .send(json!({"type": "sdp_offer", "user_id": 77, "payload": {"sdp": "v=0"}}))
        .await;
    let offer = bob.recv_kind("sdp_offer").await;
    assert_eq!(offer["user_id"], 1);
    assert_eq!(offer["room_id"], 42);
    assert_eq!(offer["payload"], json!({"sdp": "v=0"}));

    bob.send(json!({"type": "ice_candidate", "payload": {"candidate": "c1"}}))
        .await;
    let candidate = alice.recv_kind("ice_candidate").await;
    assert_eq!(candidate["user_id"], 2);
    assert_eq!(candidate["payload"]["candidate"], "c1");
}

#[tokio::test]
async fn test_malformed_frames_do_not_close_connection() {
    let (addr, _server) = start_server();
    let mut client = TestClient::connect(addr, 1).await;

    client
        .ws
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    client.send(json!({"type": "chat", "payload": "hi"})).await;
    client.send(json!({"type": "sdp_offer", "payload": {}})).await;
    client.send(json!({"type": "join_room", "room_id": 3})).await;

    assert_eq!(client.recv_kind("user_joined").await["room_id"], 3);
}

#[tokio::test]
async fn test_connection_without_identity_is_unauthorized() {
    let (addr, server) = start_server();
    let result = connect_async(format!("ws://{}/ws", addr)).await;

    match result {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 401),
        other => panic!("expected HTTP 401, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert_eq!(server.connection_count().await, 0);
}

#[tokio::test]
async fn test_disconnect_destroys_room() {
    let (addr, server) = start_server();
    let mut client = TestClient::connect(addr, 3).await;
    client.send(json!({"type": "join_room", "room_id": 9})).await;
    client.recv_kind("user_joined").await;
    assert_eq!(server.room_count().await, 1);

    client.ws.close(None).await.unwrap();
    drop(client);

    assert!(wait_for_counts(&server, 0, 0).await);
}

#[tokio::test]
async fn test_peer_disconnect_notifies_room() {
    let (addr, _server) = start_server();
    let mut alice = TestClient::connect(addr, 1).await;
    let mut bob = TestClient::connect(addr, 2).await;
    alice.send(json!({"type": "join_room", "room_id": 5})).await;
    alice.recv_kind("user_joined").await;
    bob.send(json!({"type": "join_room", "room_id": 5})).await;
    bob.recv_kind("user_joined").await;
    alice.recv_kind("user_joined").await;

    bob.ws.close(None).await.unwrap();

    let left = alice.recv_kind("user_left").await;
    assert_eq!(left["payload"]["user_id"], 2);
    assert_eq!(left["room_id"], 5);
}

#[tokio::test]
async fn test_duplicate_connection_replaces_previous() {
    let (addr, server) = start_server();
    let mut first = TestClient::connect(addr, 1).await;
    first.send(json!({"type": "join_room", "room_id": 1})).await;
    first.recv_kind("user_joined").await;

    let mut second = TestClient::connect(addr, 1).await;
    assert!(first.wait_closed().await);

    second.send(json!({"type": "join_room", "room_id": 1})).await;
    second.recv_kind("user_joined").await;
    assert_eq!(server.connection_count().await, 1);
    assert_eq!(server.rooms().member_ids(1).await, vec![1]);
}

#[tokio::test]
async fn test_health_and_stats_endpoints() {
    let (addr, _server) = start_server();

    let health = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(health, "OK");

    let mut client = TestClient::connect(addr, 8).await;
    client.send(json!({"type": "join_room", "room_id": 2})).await;
    client.recv_kind("user_joined").await;

    let stats: Value = reqwest::get(format!("http://{}/stats", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats, json!({"connections": 1, "rooms": 1}));
}

#[tokio::test]
async fn test_shutdown_closes_live_connections() {
    let (addr, server) = start_server();
    let mut client = TestClient::connect(addr, 4).await;
    client.send(json!({"type": "join_room", "room_id": 6})).await;
    client.recv_kind("user_joined").await;

    server.shutdown(Duration::from_secs(2)).await.unwrap();

    assert!(client.wait_closed().await);
    assert_eq!(server.connection_count().await, 0);
    assert_eq!(server.room_count().await, 0);
}
