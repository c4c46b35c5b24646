//! Tests for the MCP HTTP surface: initialize, listings, session headers,
//! DELETE/GET behavior, and error mapping.

use std::sync::Arc;

use serde_json::{Value, json};

use browser_bridge_mcp::transport::{ChannelSocket, HttpReply, HttpRequest, SocketEvent};
use browser_bridge_mcp::{Bridge, BridgeConfig};
use tokio::sync::mpsc;

// =============================================================================
// Helpers
// =============================================================================

fn bridge() -> Arc<Bridge> {
    Bridge::new(BridgeConfig::for_testing()).expect("bridge")
}

fn http(method: &str, url: &str, headers: &[(&str, &str)], body: &str) -> HttpRequest {
    HttpRequest::new(
        method,
        url,
        headers.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())),
        body,
    )
}

fn rpc_body(method: &str, params: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }).to_string()
}

async fn post(
    bridge: &Bridge,
    method: &str,
    params: Value,
    headers: &[(&str, &str)],
) -> browser_bridge_mcp::transport::HttpResponse {
    let request = http("POST", "/", headers, &rpc_body(method, params));
    match bridge.handle_http(&request).await {
        HttpReply::Response(response) => response,
        HttpReply::EventStream(_) => panic!("expected a plain response"),
    }
}

fn result_of(response: &browser_bridge_mcp::transport::HttpResponse) -> Value {
    let body: Value = serde_json::from_str(&response.body).expect("json body");
    body["result"].clone()
}

async fn connect_frontend(
    bridge: &Arc<Bridge>,
    session_id: &str,
    token: &str,
) -> (String, mpsc::Receiver<SocketEvent>) {
    let (socket, mut rx) = ChannelSocket::new();
    let conn_id = bridge.on_ws_connect(Some(session_id), socket).expect("connect");
    let auth = json!({
        "type": "authenticate",
        "authToken": token,
        "origin": "https://game.example",
    });
    bridge.on_ws_message(&conn_id, &auth.to_string()).await;
    // Drain the `authenticated` ack.
    let ack = rx.recv().await.expect("auth ack");
    let SocketEvent::Text(text) = ack else { panic!("expected ack frame") };
    assert_eq!(serde_json::from_str::<Value>(&text).unwrap()["type"], "authenticated");
    (conn_id, rx)
}

async fn register_tool(bridge: &Bridge, conn_id: &str, name: &str, schema: Value) {
    let frame = json!({
        "type": "register-tool",
        "tool": { "name": name, "description": "test tool", "inputSchema": schema },
    });
    bridge.on_ws_message(conn_id, &frame.to_string()).await;
}

// =============================================================================
// initialize
// =============================================================================

#[tokio::test]
async fn test_initialize_contract() {
    let bridge = bridge();
    let response = post(
        &bridge,
        "initialize",
        json!({ "protocolVersion": "2024-11-05" }),
        &[("Authorization", "Bearer t")],
    )
    .await;

    assert_eq!(response.status, 200);
    let result = result_of(&response);
    assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
    assert!(result["serverInfo"]["name"].is_string());

    let first = response.header("Mcp-Session-Id").expect("session header").to_string();
    assert!(!first.is_empty());

    // A second initialize mints a different session.
    let response = post(
        &bridge,
        "initialize",
        json!({ "protocolVersion": "2024-11-05" }),
        &[("Authorization", "Bearer t")],
    )
    .await;
    let second = response.header("Mcp-Session-Id").expect("session header");
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_initialize_requires_token() {
    let bridge = bridge();
    let response = post(&bridge, "initialize", json!({}), &[]).await;

    assert_eq!(response.status, 200);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["error"]["code"], -32600);
    assert_eq!(body["error"]["message"], "MissingAuthentication");
}

#[tokio::test]
async fn test_initialize_accepts_query_token() {
    let bridge = bridge();
    let request = http("POST", "/?token=t-123", &[], &rpc_body("initialize", json!({})));
    let HttpReply::Response(response) = bridge.handle_http(&request).await else {
        panic!("expected response")
    };
    assert!(response.header("Mcp-Session-Id").is_some());
}

#[tokio::test]
async fn test_initialized_notification_returns_202() {
    let bridge = bridge();
    let request = http(
        "POST",
        "/",
        &[("Authorization", "Bearer t")],
        &json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }).to_string(),
    );
    let HttpReply::Response(response) = bridge.handle_http(&request).await else {
        panic!("expected response")
    };
    assert_eq!(response.status, 202);
    assert!(response.body.is_empty());
}

#[tokio::test]
async fn test_unknown_method() {
    let bridge = bridge();
    let response =
        post(&bridge, "tools/frobnicate", json!({}), &[("Authorization", "Bearer t")]).await;
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["error"]["code"], -32601);
    assert!(body["error"]["message"].as_str().unwrap().starts_with("UnknownMethod"));
}

#[tokio::test]
async fn test_malformed_body_is_parse_error() {
    let bridge = bridge();
    let request = http("POST", "/", &[], "{not json");
    let HttpReply::Response(response) = bridge.handle_http(&request).await else {
        panic!("expected response")
    };
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["error"]["code"], -32700);
}

// =============================================================================
// tools/list
// =============================================================================

#[tokio::test]
async fn test_tools_list_empty_fleet_is_soft_error() {
    let bridge = bridge();
    let response = post(&bridge, "tools/list", json!({}), &[("Authorization", "Bearer T")]).await;

    let result = result_of(&response);
    assert_eq!(result["isError"], true);
    assert_eq!(result["error"], "SessionNotFound");
    assert_eq!(result["availableSessions"], json!([]));

    // The built-in catalog is still listed.
    let tools = result["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "list_sessions"));
}

#[tokio::test]
async fn test_tools_list_single_session() {
    let bridge = bridge();
    let (conn, _rx) = connect_frontend(&bridge, "a", "T").await;
    register_tool(&bridge, &conn, "move", json!({"type": "object"})).await;

    let result =
        result_of(&post(&bridge, "tools/list", json!({}), &[("Authorization", "Bearer T")]).await);

    assert!(result.get("isError").is_none());
    let tools = result["tools"].as_array().unwrap();
    let entry = tools.iter().find(|t| t["name"] == "move").expect("move listed");
    // One session: no disambiguation property injected.
    assert!(entry["inputSchema"]["properties"].get("session_id").is_none());
    assert!(result.get("_meta").is_none());
}

#[tokio::test]
async fn test_tools_list_multi_session_annotates() {
    let bridge = bridge();
    let (conn_a, _rx_a) = connect_frontend(&bridge, "a", "T").await;
    let (conn_b, _rx_b) = connect_frontend(&bridge, "b", "T").await;
    let schema = json!({"type": "object", "properties": {"to": {"type": "string"}}});
    register_tool(&bridge, &conn_a, "move", schema.clone()).await;
    register_tool(&bridge, &conn_b, "move", schema).await;

    let result =
        result_of(&post(&bridge, "tools/list", json!({}), &[("Authorization", "Bearer T")]).await);

    let tools = result["tools"].as_array().unwrap();
    // Agreeing registrations collapse to one entry.
    let moves: Vec<&Value> = tools.iter().filter(|t| t["name"] == "move").collect();
    assert_eq!(moves.len(), 1);
    let required = moves[0]["inputSchema"]["required"].as_array().unwrap();
    assert!(required.contains(&json!("session_id")));

    let available = result["_meta"]["available_sessions"].as_array().unwrap();
    assert_eq!(available.len(), 2);
}

#[tokio::test]
async fn test_tools_list_scoped_to_token() {
    let bridge = bridge();
    let (conn_a, _rx_a) = connect_frontend(&bridge, "a", "T").await;
    register_tool(&bridge, &conn_a, "move", json!({"type": "object"})).await;
    let (conn_b, _rx_b) = connect_frontend(&bridge, "b", "U").await;
    register_tool(&bridge, &conn_b, "paint", json!({"type": "object"})).await;

    let result =
        result_of(&post(&bridge, "tools/list", json!({}), &[("Authorization", "Bearer U")]).await);
    let tools = result["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "paint"));
    assert!(!tools.iter().any(|t| t["name"] == "move"));
}

// =============================================================================
// resources / prompts follow the tools pattern
// =============================================================================

#[tokio::test]
async fn test_resources_and_prompts_listings() {
    let bridge = bridge();

    // Empty fleet: soft error.
    let result = result_of(
        &post(&bridge, "resources/list", json!({}), &[("Authorization", "Bearer T")]).await,
    );
    assert_eq!(result["isError"], true);
    assert_eq!(result["error"], "SessionNotFound");

    // With a session: empty catalogs.
    let (_conn, _rx) = connect_frontend(&bridge, "a", "T").await;
    let result = result_of(
        &post(&bridge, "resources/list", json!({}), &[("Authorization", "Bearer T")]).await,
    );
    assert_eq!(result["resources"], json!([]));
    assert!(result.get("isError").is_none());

    let result = result_of(
        &post(&bridge, "prompts/list", json!({}), &[("Authorization", "Bearer T")]).await,
    );
    assert_eq!(result["prompts"], json!([]));
}

#[tokio::test]
async fn test_resource_read_and_prompt_get_follow_tools_taxonomy() {
    let bridge = bridge();

    // Empty fleet: SessionNotFound, same as tools/call.
    for method in ["resources/read", "prompts/get"] {
        let result = result_of(
            &post(&bridge, method, json!({ "uri": "x" }), &[("Authorization", "Bearer T")]).await,
        );
        assert_eq!(result["isError"], true, "{method} with no sessions");
        assert_eq!(result["error"], "SessionNotFound");
        assert_eq!(result["available_sessions"], json!([]));
    }

    // With a session: nothing registered, so not-found with candidates.
    let (_conn, _rx) = connect_frontend(&bridge, "a", "T").await;

    let result = result_of(
        &post(&bridge, "resources/read", json!({ "uri": "x" }), &[("Authorization", "Bearer T")])
            .await,
    );
    assert_eq!(result["isError"], true);
    assert_eq!(result["error"], "ToolNotFound");
    assert_eq!(result["available_resources"], json!([]));

    let result = result_of(
        &post(&bridge, "prompts/get", json!({ "name": "p" }), &[("Authorization", "Bearer T")])
            .await,
    );
    assert_eq!(result["isError"], true);
    assert_eq!(result["error"], "ToolNotFound");
    assert_eq!(result["available_prompts"], json!([]));
}

// =============================================================================
// GET / DELETE
// =============================================================================

#[tokio::test]
async fn test_get_without_accept_returns_server_info() {
    let bridge = bridge();
    let HttpReply::Response(response) = bridge.handle_http(&http("GET", "/", &[], "")).await
    else {
        panic!("expected response")
    };
    assert_eq!(response.status, 200);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["name"], "test-bridge");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_sse_without_session_header_errors() {
    let bridge = bridge();
    let request = http("GET", "/", &[("Accept", "text/event-stream")], "");
    let HttpReply::EventStream(mut stream) = bridge.handle_http(&request).await else {
        panic!("expected event stream")
    };
    let event = stream.events.recv().await.expect("error event");
    assert!(event.contains("Mcp-Session-Id header required"));
    assert_eq!(stream.events.recv().await, None);
}

#[tokio::test]
async fn test_delete_lifecycle() {
    let bridge = bridge();
    let response =
        post(&bridge, "initialize", json!({}), &[("Authorization", "Bearer t")]).await;
    let session_id = response.header("Mcp-Session-Id").unwrap().to_string();

    // Missing header: 400.
    let HttpReply::Response(response) = bridge.handle_http(&http("DELETE", "/", &[], "")).await
    else {
        panic!("expected response")
    };
    assert_eq!(response.status, 400);

    // Known session: removed.
    let request = http("DELETE", "/", &[("Mcp-Session-Id", session_id.as_str())], "");
    let HttpReply::Response(response) = bridge.handle_http(&request).await else {
        panic!("expected response")
    };
    assert_eq!(response.status, 200);
    let body: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["success"], true);

    // Second delete: 404.
    let request = http("DELETE", "/", &[("Mcp-Session-Id", session_id.as_str())], "");
    let HttpReply::Response(response) = bridge.handle_http(&request).await else {
        panic!("expected response")
    };
    assert_eq!(response.status, 404);
}

#[tokio::test]
async fn test_options_preflight() {
    let bridge = bridge();
    let HttpReply::Response(response) = bridge.handle_http(&http("OPTIONS", "/", &[], "")).await
    else {
        panic!("expected response")
    };
    assert_eq!(response.status, 204);
    assert_eq!(response.header("Access-Control-Allow-Origin"), Some("*"));
    assert!(
        response
            .header("Access-Control-Allow-Methods")
            .is_some_and(|methods| methods.contains("DELETE"))
    );
}
