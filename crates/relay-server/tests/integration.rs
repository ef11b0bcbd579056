//! End-to-end tests using a real WebSocket client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use relay_core::RelayPolicy;
use relay_server::{RelayServer, ServerConfig};
use serde_json::{Value, json};
use tokio::time::{Instant, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Boot a test server on an ephemeral port.
async fn boot_server(config: ServerConfig) -> (SocketAddr, Arc<RelayServer>) {
    let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
    let server = Arc::new(RelayServer::new(config, metrics_handle));
    let (addr, _handle) = server.listen().await.unwrap();
    (addr, server)
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: &Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

/// Next text frame as JSON, skipping transport pings.
async fn recv_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert that no text frame arrives within `window`.
async fn assert_silent(ws: &mut WsStream, window: Duration) {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match timeout(remaining, ws.next()).await {
            Err(_) => return,
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
            Ok(other) => panic!("expected silence, got {other:?}"),
        }
    }
}

/// Read until the server closes the connection, ignoring anything queued before.
async fn wait_closed(ws: &mut WsStream) {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("socket was not closed") {
            None | Some(Err(_) | Ok(Message::Close(_))) => return,
            Some(Ok(_)) => {}
        }
    }
}

/// Join a room and consume the first `room_info`.
async fn join(addr: SocketAddr, room: &str, username: &str, create: bool) -> (WsStream, Value) {
    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        &json!({"room": room, "username": username, "create": create}),
    )
    .await;
    let info = recv_json(&mut ws).await;
    assert_eq!(info["type"], "room_info", "join failed: {info}");
    (ws, info)
}

async fn wait_until(server: &RelayServer, mut done: impl FnMut(&RelayServer) -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !done(server) {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ── Scenario ──

#[tokio::test]
async fn lobby_scenario() {
    let (addr, server) = boot_server(ServerConfig::default()).await;

    // alice creates the lobby.
    let (mut alice, info) = join(addr, "lobby", "alice", true).await;
    assert_eq!(info["data"]["users"], json!(["alice"]));

    // A second "alice" is rejected, then closed.
    let mut impostor = connect(addr).await;
    send_json(
        &mut impostor,
        &json!({"room": "lobby", "username": "alice", "create": false}),
    )
    .await;
    let err = recv_json(&mut impostor).await;
    assert_eq!(err, json!({"type": "error", "data": "Username already exists in this room"}));
    wait_closed(&mut impostor).await;

    // bob joins; both see the two-member room.
    let (mut bob, info) = join(addr, "lobby", "bob", false).await;
    assert_eq!(info["data"]["users"], json!(["alice", "bob"]));
    let info = recv_json(&mut alice).await;
    assert_eq!(info["type"], "room_info");
    assert_eq!(info["data"]["users"], json!(["alice", "bob"]));

    // An offer reaches bob verbatim and never echoes to alice.
    let offer = json!({"type": "offer", "sdp": {"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"}});
    send_json(&mut alice, &offer).await;
    assert_eq!(recv_json(&mut bob).await, offer);
    assert_silent(&mut alice, Duration::from_millis(200)).await;

    // alice leaves.
    send_json(&mut alice, &json!({"action": "leave"})).await;
    let info = recv_json(&mut bob).await;
    assert_eq!(info["data"]["users"], json!(["bob"]));
    wait_closed(&mut alice).await;

    // bob disconnects; the room disappears.
    bob.close(None).await.unwrap();
    wait_until(&server, |s| s.directory().connection_count() == 0).await;
    let status = server.status().snapshot();
    assert_eq!(status.connections, 0);
    assert!(status.rooms.is_empty());
}

#[tokio::test]
async fn join_missing_room_without_create_is_rejected() {
    let (addr, server) = boot_server(ServerConfig::default()).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, &json!({"room": "nowhere", "username": "alice"})).await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err, json!({"type": "error", "data": "Room doesn't exist"}));
    wait_closed(&mut ws).await;
    assert_eq!(server.directory().room_count(), 0);
}

#[tokio::test]
async fn null_create_is_treated_as_absent() {
    let (addr, server) = boot_server(ServerConfig::default()).await;

    let mut ws = connect(addr).await;
    send_json(&mut ws, &json!({"room": "nowhere", "username": "alice", "create": null})).await;
    let err = recv_json(&mut ws).await;
    assert_eq!(err, json!({"type": "error", "data": "Room doesn't exist"}));
    wait_closed(&mut ws).await;
    assert_eq!(server.directory().room_count(), 0);
}

#[tokio::test]
async fn zero_outbound_queue_still_admits() {
    let (addr, server) = boot_server(ServerConfig {
        outbound_queue: 0,
        ..ServerConfig::default()
    })
    .await;

    let (_alice, info) = join(addr, "lobby", "alice", true).await;
    assert_eq!(info["data"]["users"], json!(["alice"]));
    assert_eq!(server.directory().connection_count(), 1);
}

#[tokio::test]
async fn implicit_create_lets_first_joiner_create() {
    let config = ServerConfig {
        implicit_create: true,
        ..ServerConfig::default()
    };
    let (addr, server) = boot_server(config).await;

    let (_alice, info) = join(addr, "studio", "alice", false).await;
    assert_eq!(info["data"]["users"], json!(["alice"]));
    assert_eq!(server.directory().members_of("studio"), vec!["alice"]);
}

#[tokio::test]
async fn invalid_join_is_rejected() {
    let (addr, server) = boot_server(ServerConfig::default()).await;

    let mut ws = connect(addr).await;
    ws.send(Message::text("hello")).await.unwrap();
    let err = recv_json(&mut ws).await;
    assert_eq!(err, json!({"type": "error", "data": "Invalid join request"}));
    wait_closed(&mut ws).await;
    assert_eq!(server.directory().connection_count(), 0);
}

#[tokio::test]
async fn legacy_action_join_is_accepted() {
    let (addr, _server) = boot_server(ServerConfig::default()).await;

    let mut ws = connect(addr).await;
    send_json(
        &mut ws,
        &json!({"action": "join", "room": "lobby", "username": "alice", "create": true}),
    )
    .await;
    assert_eq!(recv_json(&mut ws).await["type"], "room_info");
}

// ── Timeouts ──

#[tokio::test]
async fn handshake_timeout_closes_without_registering() {
    let config = ServerConfig {
        join_timeout: Duration::from_millis(200),
        ..ServerConfig::default()
    };
    let (addr, server) = boot_server(config).await;

    let mut ws = connect(addr).await;
    // Only a close frame may arrive: no envelope is sent.
    match timeout(TIMEOUT, ws.next()).await.expect("socket was not closed") {
        None | Some(Err(_) | Ok(Message::Close(_))) => {}
        Some(Ok(other)) => panic!("unexpected frame before close: {other:?}"),
    }
    assert_eq!(server.directory().connection_count(), 0);
    assert_eq!(server.directory().room_count(), 0);
}

#[tokio::test]
async fn silent_session_is_departed_by_heartbeat() {
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let (addr, server) = boot_server(config).await;

    // alice joins, then never reads or writes again, so she never answers pings.
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;

    wait_until(&server, |s| s.directory().connection_count() == 0).await;
    assert_eq!(server.directory().room_count(), 0);
    wait_closed(&mut alice).await;
}

#[tokio::test]
async fn application_ping_keeps_session_alive() {
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_timeout: Duration::from_millis(300),
        ..ServerConfig::default()
    };
    let (addr, server) = boot_server(config).await;

    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    for _ in 0..10 {
        send_json(&mut alice, &json!({"type": "ping"})).await;
        assert_eq!(recv_json(&mut alice).await, json!({"type": "pong"}));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(server.directory().members_of("lobby"), vec!["alice"]);
}

// ── Relay semantics ──

#[tokio::test]
async fn relays_preserve_per_sender_order() {
    let (addr, _server) = boot_server(ServerConfig::default()).await;
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    let (mut bob, _) = join(addr, "lobby", "bob", false).await;
    let _ = recv_json(&mut alice).await;

    for seq in 0..50 {
        send_json(&mut alice, &json!({"ice": {"candidate": format!("candidate:{seq}")}})).await;
    }
    for seq in 0..50 {
        let frame = recv_json(&mut bob).await;
        assert_eq!(frame["ice"]["candidate"], format!("candidate:{seq}"));
    }
}

#[tokio::test]
async fn relays_stay_inside_the_room() {
    let (addr, _server) = boot_server(ServerConfig::default()).await;
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    let (mut bob, _) = join(addr, "lobby", "bob", false).await;
    let (mut carol, _) = join(addr, "studio", "carol", true).await;
    let _ = recv_json(&mut alice).await;

    let answer = json!({"type": "answer", "sdp": "v=0"});
    send_json(&mut bob, &answer).await;
    assert_eq!(recv_json(&mut alice).await, answer);
    assert_silent(&mut carol, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn strict_policy_drops_unrecognized_frames() {
    let config = ServerConfig {
        relay_policy: RelayPolicy::Strict,
        ..ServerConfig::default()
    };
    let (addr, _server) = boot_server(config).await;
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    let (mut bob, _) = join(addr, "lobby", "bob", false).await;
    let _ = recv_json(&mut alice).await;

    send_json(&mut alice, &json!({"type": "renegotiate"})).await;
    let offer = json!({"sdp": {"type": "offer", "sdp": "v=0"}});
    send_json(&mut alice, &offer).await;
    assert_eq!(recv_json(&mut bob).await, offer);
}

#[tokio::test]
async fn malformed_frame_does_not_end_session() {
    let (addr, server) = boot_server(ServerConfig::default()).await;
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    let (mut bob, _) = join(addr, "lobby", "bob", false).await;
    let _ = recv_json(&mut alice).await;

    alice.send(Message::text("{not json")).await.unwrap();
    let ice = json!({"ice": {"candidate": "candidate:1"}});
    send_json(&mut alice, &ice).await;
    assert_eq!(recv_json(&mut bob).await, ice);
    assert_eq!(server.directory().connection_count(), 2);
}

#[tokio::test]
async fn stream_presence_is_broadcast() {
    let (addr, _server) = boot_server(ServerConfig::default()).await;
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    let (mut bob, _) = join(addr, "lobby", "bob", false).await;
    let _ = recv_json(&mut alice).await;

    send_json(&mut alice, &json!({"action": "start_stream"})).await;
    let info = recv_json(&mut bob).await;
    assert_eq!(info["data"]["streamingUsers"], json!(["alice"]));

    send_json(&mut alice, &json!({"action": "end_stream"})).await;
    let info = recv_json(&mut bob).await;
    assert_eq!(info["data"]["streamingUsers"], json!([]));
    assert_eq!(
        recv_json(&mut bob).await,
        json!({"type": "stream_ended", "data": "alice"})
    );
}

// ── HTTP surface ──

#[tokio::test]
async fn status_and_rooms_over_http() {
    let (addr, _server) = boot_server(ServerConfig::default()).await;
    let (_alice, _) = join(addr, "lobby", "alice", true).await;

    let status: Value = reqwest::get(format!("http://{addr}/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["connections"], 1);
    assert_eq!(status["rooms"][0]["name"], "lobby");
    assert_eq!(status["rooms"][0]["members"], json!(["alice"]));

    let rooms: Value = reqwest::get(format!("http://{addr}/rooms"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rooms["lobby"]["users"], json!(["alice"]));

    let health = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(health.status(), 200);
}

// ── Shutdown ──

#[tokio::test]
async fn shutdown_departs_every_session() {
    let (addr, server) = boot_server(ServerConfig::default()).await;
    let (mut alice, _) = join(addr, "lobby", "alice", true).await;
    let (mut bob, _) = join(addr, "lobby", "bob", false).await;

    server
        .shutdown()
        .graceful_shutdown(server.directory(), Vec::new(), Some(TIMEOUT))
        .await;

    assert_eq!(server.directory().connection_count(), 0);
    assert_eq!(server.directory().room_count(), 0);
    wait_closed(&mut alice).await;
    wait_closed(&mut bob).await;
}
