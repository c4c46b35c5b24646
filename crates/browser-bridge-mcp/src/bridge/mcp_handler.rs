//! MCP protocol handler.
//!
//! Dispatches the HTTP surface: JSON-RPC over `POST /`, SSE attachment and
//! liveness info on `GET /`, session teardown on `DELETE /`, and CORS
//! preflight. Tool listings aggregate every frontend session under the
//! calling token; calls are routed through the correlator to the owning
//! frontend.

use std::sync::Arc;

use serde_json::{Value, json};

use crate::bridge::correlator::Correlator;
use crate::bridge::notifier::Notifier;
use crate::bridge::session::{Registry, Session};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, CallError, ErrorCode};
use crate::protocol::jsonrpc::{JsonRpcRequest, JsonRpcResponse};
use crate::protocol::mcp;
use crate::protocol::messages::ToolDefinition;
use crate::tools::{BridgeTool, ToolContext, register_builtin_tools};
use crate::transport::{HttpReply, HttpRequest, HttpResponse, SseStream};

/// Header carrying the MCP session id.
pub const MCP_SESSION_HEADER: &str = "Mcp-Session-Id";

/// HTTP front-end for MCP clients.
pub struct McpHandler {
    config: Arc<BridgeConfig>,
    registry: Arc<Registry>,
    correlator: Correlator,
    notifier: Notifier,
    builtin: Vec<Box<dyn BridgeTool>>,
}

impl McpHandler {
    /// Wire the handler to the bridge's shared state.
    #[must_use]
    pub fn new(
        config: Arc<BridgeConfig>,
        registry: Arc<Registry>,
        correlator: Correlator,
        notifier: Notifier,
    ) -> Self {
        Self { config, registry, correlator, notifier, builtin: register_builtin_tools() }
    }

    /// Handle one HTTP exchange.
    pub async fn handle(&self, request: &HttpRequest) -> HttpReply {
        match request.method.as_str() {
            "OPTIONS" => HttpReply::Response(HttpResponse::empty(204)),
            "POST" => self.handle_post(request).await,
            "GET" => self.handle_get(request).await,
            "DELETE" => self.handle_delete(request).await,
            _ => HttpReply::Response(HttpResponse::json(
                405,
                &json!({ "error": "Method not allowed" }),
            )),
        }
    }

    async fn handle_post(&self, request: &HttpRequest) -> HttpReply {
        let rpc: JsonRpcRequest = match serde_json::from_str(&request.body) {
            Ok(rpc) => rpc,
            Err(e) => {
                let error = BridgeError::from(e);
                return HttpReply::Response(HttpResponse::json(
                    200,
                    &to_value(&JsonRpcResponse::error(
                        None,
                        error.jsonrpc_code(),
                        error.to_string(),
                    )),
                ));
            }
        };

        tracing::debug!(method = %rpc.method, "Handling MCP request");

        let method = rpc.method.clone();
        match method.as_str() {
            "initialize" => self.handle_initialize(request, rpc).await,
            "notifications/initialized" | "notifications/cancelled" => {
                HttpReply::Response(HttpResponse::empty(202))
            }
            "ping" => {
                HttpReply::Response(HttpResponse::json(
                    200,
                    &to_value(&JsonRpcResponse::success(rpc.id, json!({}))),
                ))
            }
            _ => {
                // Everything else runs in the scope of an auth token.
                let Some(token) = self.resolve_token(request).await else {
                    let error = BridgeError::MissingAuthentication;
                    return HttpReply::Response(HttpResponse::json(
                        200,
                        &to_value(&JsonRpcResponse::error(
                            rpc.id,
                            error.jsonrpc_code(),
                            error.to_string(),
                        )),
                    ));
                };

                let response = match method.as_str() {
                    "tools/list" => {
                        JsonRpcResponse::success(rpc.id, self.tools_list(&token).await)
                    }
                    "tools/call" => self.tools_call(&token, rpc).await,
                    "resources/list" => JsonRpcResponse::success(
                        rpc.id,
                        self.empty_catalog(&token, "resources").await,
                    ),
                    "resources/read" => JsonRpcResponse::success(
                        rpc.id,
                        self.item_not_found(&token, "available_resources").await,
                    ),
                    "prompts/list" => JsonRpcResponse::success(
                        rpc.id,
                        self.empty_catalog(&token, "prompts").await,
                    ),
                    "prompts/get" => JsonRpcResponse::success(
                        rpc.id,
                        self.item_not_found(&token, "available_prompts").await,
                    ),
                    other => {
                        if rpc.is_notification() {
                            return HttpReply::Response(HttpResponse::empty(202));
                        }
                        let error = BridgeError::unknown_method(other);
                        JsonRpcResponse::error(rpc.id, error.jsonrpc_code(), error.to_string())
                    }
                };
                HttpReply::Response(HttpResponse::json(200, &to_value(&response)))
            }
        }
    }

    async fn handle_initialize(&self, request: &HttpRequest, rpc: JsonRpcRequest) -> HttpReply {
        let Some(token) = request.auth_token() else {
            let error = BridgeError::MissingAuthentication;
            return HttpReply::Response(HttpResponse::json(
                200,
                &to_value(&JsonRpcResponse::error(rpc.id, error.jsonrpc_code(), error.to_string())),
            ));
        };

        let mcp_session_id = self.notifier.create(&token).await;
        let result = mcp::initialize_result(&self.config, &rpc.params);

        let response = HttpResponse::json(200, &to_value(&JsonRpcResponse::success(rpc.id, result)))
            .with_header(MCP_SESSION_HEADER, mcp_session_id);
        HttpReply::Response(response)
    }

    async fn handle_get(&self, request: &HttpRequest) -> HttpReply {
        if !request.accepts_event_stream() {
            // Liveness probe.
            return HttpReply::Response(HttpResponse::json(200, &mcp::server_info(&self.config)));
        }

        let Some(mcp_session_id) = request.header(MCP_SESSION_HEADER) else {
            return HttpReply::EventStream(SseStream::error("Mcp-Session-Id header required"));
        };

        match self.notifier.attach(mcp_session_id).await {
            Some(stream) => HttpReply::EventStream(stream),
            None => HttpReply::EventStream(SseStream::error("Unknown Mcp-Session-Id")),
        }
    }

    async fn handle_delete(&self, request: &HttpRequest) -> HttpReply {
        let Some(mcp_session_id) = request.header(MCP_SESSION_HEADER) else {
            return HttpReply::Response(HttpResponse::json(
                400,
                &json!({ "error": "Mcp-Session-Id header required" }),
            ));
        };

        if self.notifier.remove(mcp_session_id).await {
            HttpReply::Response(HttpResponse::json(200, &json!({ "success": true })))
        } else {
            HttpReply::Response(HttpResponse::json(404, &json!({ "error": "Unknown MCP session" })))
        }
    }

    /// Token scope of a non-initialize request: the MCP session named by the
    /// header, falling back to request credentials.
    async fn resolve_token(&self, request: &HttpRequest) -> Option<String> {
        if let Some(id) = request.header(MCP_SESSION_HEADER) {
            if let Some(token) = self.notifier.token_of(id).await {
                return Some(token);
            }
        }
        request.auth_token()
    }

    /// Aggregate `tools/list` across the token's sessions.
    async fn tools_list(&self, token: &str) -> Value {
        let sessions = self.registry.sessions_for_token(token).await;

        let mut entries: Vec<Value> = self
            .builtin
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.input_schema(),
                })
            })
            .collect();

        if sessions.is_empty() {
            return json!({
                "tools": entries,
                "isError": true,
                "error": ErrorCode::SessionNotFound.as_str(),
                "availableSessions": [],
            });
        }

        let multi = sessions.len() > 1;

        // Deduplicate by (name, schema); agreeing registrations collapse to
        // one entry, and the registry guarantees there are no disagreeing
        // ones under a single token.
        let mut unique: Vec<ToolDefinition> = Vec::new();
        for session in &sessions {
            for tool in session.tools_snapshot() {
                if !unique.iter().any(|seen| seen.name == tool.name && seen.schema_eq(&tool)) {
                    unique.push(tool);
                }
            }
        }
        unique.sort_by(|a, b| a.name.cmp(&b.name));

        for tool in &unique {
            let entry = mcp::tool_entry(tool);
            entries.push(if multi { mcp::annotate_with_session_id(&entry) } else { entry });
        }

        let mut result = json!({ "tools": entries });
        if multi {
            result["_meta"] = json!({ "available_sessions": session_summaries(&sessions) });
        }
        result
    }

    /// Listing for surfaces no frontend registers anything on yet.
    async fn empty_catalog(&self, token: &str, key: &str) -> Value {
        let sessions = self.registry.sessions_for_token(token).await;
        let mut result = serde_json::Map::new();
        result.insert(key.to_string(), json!([]));
        if sessions.is_empty() {
            result.insert("isError".to_string(), json!(true));
            result.insert("error".to_string(), json!(ErrorCode::SessionNotFound.as_str()));
            result.insert("availableSessions".to_string(), json!([]));
        }
        Value::Object(result)
    }

    /// Read/get on a surface no frontend has populated. The tools taxonomy
    /// applies: an empty fleet is `SessionNotFound` before anything is
    /// looked up, then not-found with an empty candidate list.
    async fn item_not_found(&self, token: &str, key: &str) -> Value {
        if self.registry.sessions_for_token(token).await.is_empty() {
            return mcp::soft_error(
                ErrorCode::SessionNotFound,
                json!({ "available_sessions": [] }),
            );
        }
        let mut extra = serde_json::Map::new();
        extra.insert(key.to_string(), json!([]));
        mcp::soft_error(ErrorCode::ToolNotFound, Value::Object(extra))
    }

    /// `tools/call` dispatch: built-ins short-circuit, everything else is
    /// routed to a frontend session.
    async fn tools_call(&self, token: &str, rpc: JsonRpcRequest) -> JsonRpcResponse {
        let id = rpc.id.clone();
        let Some(name) = rpc.params.get("name").and_then(Value::as_str) else {
            return JsonRpcResponse::error(id, -32602, "Missing 'name' parameter");
        };
        let name = name.to_string();
        let mut arguments = rpc.params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        if let Some(tool) = self.builtin.iter().find(|t| t.name() == name) {
            let ctx = ToolContext::new(Arc::clone(&self.registry), token);
            return match tool.execute(&ctx, arguments).await {
                Ok(result) => JsonRpcResponse::success(id, mcp::wrap_tool_result(&result)),
                Err(message) => JsonRpcResponse::success(
                    id,
                    mcp::soft_error(ErrorCode::InternalError, json!({ "message": message })),
                ),
            };
        }

        let sessions = self.registry.sessions_for_token(token).await;
        if sessions.is_empty() {
            return JsonRpcResponse::success(
                id,
                mcp::soft_error(ErrorCode::SessionNotFound, json!({ "available_sessions": [] })),
            );
        }

        let session = match self.select_session(&sessions, &name, &rpc.params, &mut arguments) {
            Ok(session) => session,
            Err(soft) => return JsonRpcResponse::success(id, soft),
        };

        if !session.has_tool(&name) {
            let available: Vec<String> =
                session.tools_snapshot().iter().map(|t| t.name.clone()).collect();
            return JsonRpcResponse::success(
                id,
                mcp::soft_error(ErrorCode::ToolNotFound, json!({ "available_tools": available })),
            );
        }

        tracing::info!(session_id = %session.id, tool = %name, "Executing frontend tool");

        let input = if arguments == json!({}) { None } else { Some(arguments) };
        match self.correlator.call(&session, &name, input, self.config.tool_call_timeout).await {
            Ok(result) => JsonRpcResponse::success(id, mcp::wrap_tool_result(&result)),
            Err(CallError::Shutdown) => {
                let error = BridgeError::Shutdown;
                JsonRpcResponse::error(id, error.jsonrpc_code(), error.to_string())
            }
            Err(error) => {
                tracing::warn!(session_id = %session.id, tool = %name, error = %error, "Tool call failed");
                JsonRpcResponse::success(
                    id,
                    mcp::soft_error(error.code(), json!({ "message": error.to_string() })),
                )
            }
        }
    }

    /// Pick the target session for a tool call:
    /// `arguments.session_id`, then `_meta.sessionId`, then the only session
    /// exposing the tool.
    fn select_session(
        &self,
        sessions: &[Arc<Session>],
        tool_name: &str,
        params: &Value,
        arguments: &mut Value,
    ) -> Result<Arc<Session>, Value> {
        let explicit = arguments
            .get("session_id")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                params
                    .get("_meta")
                    .and_then(|m| m.get("sessionId"))
                    .and_then(Value::as_str)
                    .map(String::from)
            });

        if let Some(target) = explicit {
            // The disambiguation property is bridge-level; the frontend tool
            // never declared it.
            if let Some(obj) = arguments.as_object_mut() {
                obj.remove("session_id");
            }
            return sessions.iter().find(|s| s.id == target).cloned().ok_or_else(|| {
                mcp::soft_error(
                    ErrorCode::SessionNotFound,
                    json!({ "available_sessions": session_summaries(sessions) }),
                )
            });
        }

        let exposing: Vec<&Arc<Session>> =
            sessions.iter().filter(|s| s.has_tool(tool_name)).collect();
        if exposing.len() == 1 {
            return Ok(Arc::clone(exposing[0]));
        }

        Err(mcp::soft_error(
            ErrorCode::SessionNotSpecified,
            json!({ "available_sessions": session_summaries(sessions) }),
        ))
    }
}

impl std::fmt::Debug for McpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpHandler").field("builtin", &self.builtin.len()).finish()
    }
}

fn to_value(response: &JsonRpcResponse) -> Value {
    serde_json::to_value(response).unwrap_or_else(|_| json!({ "jsonrpc": "2.0" }))
}

fn session_summaries(sessions: &[Arc<Session>]) -> Vec<Value> {
    sessions
        .iter()
        .map(|session| {
            let mut entry = json!({ "session_id": session.id, "origin": session.origin });
            if let Some(name) = &session.name {
                entry["session_name"] = json!(name);
            }
            entry
        })
        .collect()
}
