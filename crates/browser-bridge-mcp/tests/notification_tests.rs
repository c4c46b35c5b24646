//! Tests for `tools/list_changed` SSE notifications and their isolation by
//! auth token.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::mpsc;

use browser_bridge_mcp::transport::{
    ChannelSocket, HttpReply, HttpRequest, SocketEvent, SseStream,
};
use browser_bridge_mcp::{Bridge, BridgeConfig};

const LIST_CHANGED: &str = r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#;

// =============================================================================
// Helpers
// =============================================================================

async fn initialize(bridge: &Bridge, token: &str) -> String {
    let body = json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} });
    let request = HttpRequest::new(
        "POST",
        "/",
        [("Authorization".to_string(), format!("Bearer {token}"))],
        body.to_string(),
    );
    match bridge.handle_http(&request).await {
        HttpReply::Response(response) => {
            response.header("Mcp-Session-Id").expect("session header").to_string()
        }
        HttpReply::EventStream(_) => panic!("expected response"),
    }
}

async fn open_sse(bridge: &Bridge, mcp_session_id: &str) -> SseStream {
    let request = HttpRequest::new(
        "GET",
        "/",
        [
            ("Accept".to_string(), "text/event-stream".to_string()),
            ("Mcp-Session-Id".to_string(), mcp_session_id.to_string()),
        ],
        "",
    );
    match bridge.handle_http(&request).await {
        HttpReply::EventStream(stream) => stream,
        HttpReply::Response(r) => panic!("expected event stream, got {}", r.status),
    }
}

async fn connect_frontend(
    bridge: &Arc<Bridge>,
    session_id: &str,
    token: &str,
) -> (String, mpsc::Receiver<SocketEvent>) {
    let (socket, mut rx) = ChannelSocket::new();
    let conn_id = bridge.on_ws_connect(Some(session_id), socket).expect("connect");
    let auth = json!({ "type": "authenticate", "authToken": token, "origin": "o" });
    bridge.on_ws_message(&conn_id, &auth.to_string()).await;
    let _ack = rx.recv().await;
    (conn_id, rx)
}

async fn register_tool(bridge: &Bridge, conn_id: &str, name: &str) {
    let frame = json!({
        "type": "register-tool",
        "tool": { "name": name, "description": "d", "inputSchema": { "type": "object" } },
    });
    bridge.on_ws_message(conn_id, &frame.to_string()).await;
}

async fn next_event(stream: &mut SseStream) -> String {
    tokio::time::timeout(Duration::from_secs(1), stream.events.recv())
        .await
        .expect("event within 1s")
        .expect("stream open")
}

// =============================================================================
// S5 and friends
// =============================================================================

#[tokio::test]
async fn test_register_tool_notifies_matching_stream() {
    let bridge = Bridge::new(BridgeConfig::for_testing()).unwrap();
    let mcp_session = initialize(&bridge, "T").await;
    let mut stream = open_sse(&bridge, &mcp_session).await;

    let (conn, _rx) = connect_frontend(&bridge, "a", "T").await;
    // Authentication mutates the catalog (the fleet changed).
    assert_eq!(next_event(&mut stream).await, LIST_CHANGED);

    register_tool(&bridge, &conn, "x").await;
    assert_eq!(next_event(&mut stream).await, LIST_CHANGED);
}

#[tokio::test]
async fn test_notifications_are_token_isolated() {
    let bridge = Bridge::new(BridgeConfig::for_testing()).unwrap();
    let t_session = initialize(&bridge, "T").await;
    let mut t_stream = open_sse(&bridge, &t_session).await;

    // A frontend under a different token registers a tool.
    let (conn, _rx) = connect_frontend(&bridge, "u-1", "U").await;
    register_tool(&bridge, &conn, "y").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(t_stream.events.try_recv().is_err(), "T's stream must stay silent");
}

#[tokio::test]
async fn test_session_close_notifies() {
    let bridge = Bridge::new(BridgeConfig::for_testing()).unwrap();
    let mcp_session = initialize(&bridge, "T").await;

    let (conn, _rx) = connect_frontend(&bridge, "a", "T").await;
    let mut stream = open_sse(&bridge, &mcp_session).await;
    // Drain the admission notification queued before attach.
    let _ = next_event(&mut stream).await;

    bridge.on_ws_close(&conn).await;
    assert_eq!(next_event(&mut stream).await, LIST_CHANGED);
}

#[tokio::test]
async fn test_notifications_queue_until_attach() {
    let bridge = Bridge::new(BridgeConfig::for_testing()).unwrap();
    let mcp_session = initialize(&bridge, "T").await;

    // Catalog changes happen before the client opens its stream.
    let (conn, _rx) = connect_frontend(&bridge, "a", "T").await;
    register_tool(&bridge, &conn, "x").await;

    let mut stream = open_sse(&bridge, &mcp_session).await;
    assert_eq!(next_event(&mut stream).await, LIST_CHANGED);
    assert_eq!(next_event(&mut stream).await, LIST_CHANGED);
}

#[tokio::test]
async fn test_delete_ends_stream() {
    let bridge = Bridge::new(BridgeConfig::for_testing()).unwrap();
    let mcp_session = initialize(&bridge, "T").await;
    let mut stream = open_sse(&bridge, &mcp_session).await;

    let request = HttpRequest::new(
        "DELETE",
        "/",
        [("Mcp-Session-Id".to_string(), mcp_session.clone())],
        "",
    );
    let HttpReply::Response(response) = bridge.handle_http(&request).await else {
        panic!("expected response")
    };
    assert_eq!(response.status, 200);

    // Writer released before the session was destroyed: stream ends.
    assert_eq!(stream.events.recv().await, None);
}

#[tokio::test]
async fn test_schema_conflict_does_not_notify() {
    let bridge = Bridge::new(BridgeConfig::for_testing()).unwrap();
    let mcp_session = initialize(&bridge, "T").await;

    let (conn_a, _rx_a) = connect_frontend(&bridge, "a", "T").await;
    let (conn_b, _rx_b) = connect_frontend(&bridge, "b", "T").await;
    register_tool(&bridge, &conn_a, "move").await;

    let mut stream = open_sse(&bridge, &mcp_session).await;
    // Two admissions and one registration were queued.
    for _ in 0..3 {
        let _ = next_event(&mut stream).await;
    }

    // Conflicting registration mutates nothing, so no notification follows.
    let conflicting = json!({
        "type": "register-tool",
        "tool": { "name": "move", "description": "d", "inputSchema": { "type": "array" } },
    });
    bridge.on_ws_message(&conn_b, &conflicting.to_string()).await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(stream.events.try_recv().is_err());
}

#[tokio::test]
async fn test_payload_is_valid_jsonrpc_notification() {
    let value: Value = serde_json::from_str(LIST_CHANGED).unwrap();
    assert_eq!(value["jsonrpc"], "2.0");
    assert_eq!(value["method"], "notifications/tools/list_changed");
    assert!(value.get("id").is_none());
}
