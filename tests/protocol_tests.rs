mod common;

use common::{build_test_gateway, spawn_gateway};
use chat_gateway::auth::mock::StaticTokenValidator;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

async fn recv_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("websocket error");
    match msg {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// A malformed (non-JSON or schema-violating) inbound frame gets a one-shot
/// `error` reply and the connection stays open.
#[tokio::test]
async fn malformed_frame_gets_error_and_stays_open() {
    let tokens = StaticTokenValidator::new().with_token("tok-a", "alice");
    let gateway = build_test_gateway(tokens);
    let base = spawn_gateway(gateway.state).await;

    let (mut a, _) = connect_async(format!("{base}/socket/connect?token=tok-a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    a.send(Message::Text("not json at all".into())).await.unwrap();
    let err = recv_json(&mut a).await;
    assert_eq!(err["type"], "error");

    // Connection is still usable afterward.
    a.send(Message::Text(json!({ "type": "ping" }).to_string())).await.unwrap();
    let pong = recv_json(&mut a).await;
    assert_eq!(pong["type"], "pong");
}

/// A frame over the 1 MiB read limit closes the connection rather than
/// getting an `error` reply.
#[tokio::test]
async fn oversized_frame_closes_the_connection() {
    let tokens = StaticTokenValidator::new().with_token("tok-a", "alice");
    let gateway = build_test_gateway(tokens);
    let base = spawn_gateway(gateway.state).await;

    let (mut a, _) = connect_async(format!("{base}/socket/connect?token=tok-a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let oversized = "x".repeat(2 * 1024 * 1024);
    a.send(Message::Text(oversized)).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), a.next()).await;
    match outcome {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {}
        Ok(Some(Ok(other))) => panic!("expected close, got {other:?}"),
        Ok(Some(Err(_))) => {}
        Err(_) => panic!("connection did not close within the timeout"),
    }
}
