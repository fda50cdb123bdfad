//! WebSocket rules: echo, rejection, and MITM passthrough between a client
//! and an origin server.

use futures::{SinkExt, StreamExt};
use mirage::{MockServer, MockServerOptions};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message;

async fn started() -> MockServer {
    let server = MockServer::new(MockServerOptions::default()).unwrap();
    server.start(None).await.unwrap();
    server
}

fn ws_url(server: &MockServer, path: &str) -> String {
    format!("ws://localhost:{}{}", server.port().unwrap(), path)
}

#[tokio::test]
async fn echo_rule_reflects_messages() {
    let server = started().await;
    let endpoint = server.any_websocket().then_echo().unwrap();

    let (mut ws, response) = connect_async(ws_url(&server, "/socket")).await.unwrap();
    assert_eq!(response.status(), 101);

    ws.send(Message::Text("hello".into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("hello".into()));

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Binary(vec![1, 2, 3]));

    ws.close(None).await.unwrap();
    assert_eq!(endpoint.request_count(), 1);

    server.stop().await.unwrap();
}

#[tokio::test]
async fn reject_rule_refuses_the_handshake() {
    let server = started().await;
    server.any_websocket().then_reject(403, "no sockets here").unwrap();

    let result = connect_async(ws_url(&server, "/socket")).await;
    assert!(result.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unmatched_upgrade_gets_the_miss_response() {
    let server = started().await;
    // Only HTTP rules exist; no WS rule matches the upgrade.
    server.get("/socket").then_reply(200, "not a websocket").unwrap();

    let result = connect_async(ws_url(&server, "/socket")).await;
    assert!(result.is_err());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn passthrough_pipes_frames_to_the_origin_and_back() {
    let origin = started().await;
    origin.any_websocket().then_echo().unwrap();

    let mitm = started().await;
    mitm.any_websocket()
        .then_forward_to(format!("ws://localhost:{}", origin.port().unwrap()))
        .unwrap();

    let (mut ws, _) = connect_async(ws_url(&mitm, "/bridge")).await.unwrap();

    ws.send(Message::Text("hello".into())).await.unwrap();
    let reply = ws.next().await.unwrap().unwrap();
    assert_eq!(reply, Message::Text("hello".into()));

    // Close propagates through the bridge.
    ws.close(None).await.unwrap();
    while let Some(message) = ws.next().await {
        if message.is_err() || matches!(message, Ok(Message::Close(_))) {
            break;
        }
    }

    origin.stop().await.unwrap();
    mitm.stop().await.unwrap();
}

#[tokio::test]
async fn unreachable_upstream_rejects_the_handshake() {
    let mitm = started().await;
    mitm.any_websocket()
        .then_forward_to("ws://127.0.0.1:9")
        .unwrap();

    let result = connect_async(ws_url(&mitm, "/bridge")).await;
    assert!(result.is_err());

    mitm.stop().await.unwrap();
}
