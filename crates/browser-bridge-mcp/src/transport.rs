//! Transport abstraction.
//!
//! The bridge core performs no I/O of its own: the host adapter feeds it
//! [`HttpRequest`] values and WebSocket events, and consumes the returned
//! [`HttpReply`] / outbound socket events. Everything here is plain data or
//! channels so the core is testable without a network.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::defaults;

/// WebSocket ready state, normalized to the string forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ReadyState {
    /// Wire/diagnostic representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ReadyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to one frontend WebSocket, as seen by the core.
///
/// Sends are best-effort: when the peer is not [`ReadyState::Open`] the
/// message is dropped. The adapter owns the real socket and drains whatever
/// concrete channel backs this handle.
pub trait FrontendSocket: Send + Sync {
    /// Queue one text frame.
    fn send(&self, text: String);

    /// Close the socket with a code and reason.
    fn close(&self, code: u16, reason: &str);

    /// Current ready state.
    fn ready_state(&self) -> ReadyState;
}

/// Outbound event produced by a [`ChannelSocket`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// One text frame to deliver.
    Text(String),
    /// Close the underlying socket.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Channel-backed [`FrontendSocket`].
///
/// The adapter (or a test) holds the receiving end and pumps events into the
/// real socket. The channel is bounded; a slow consumer loses messages rather
/// than growing a queue.
pub struct ChannelSocket {
    tx: mpsc::Sender<SocketEvent>,
    state: Mutex<ReadyState>,
}

impl ChannelSocket {
    /// Default outbound channel capacity.
    pub const DEFAULT_CAPACITY: usize = 256;

    /// Create a socket and the receiver the adapter drains.
    #[must_use]
    pub fn new() -> (std::sync::Arc<Self>, mpsc::Receiver<SocketEvent>) {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a socket with an explicit channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> (std::sync::Arc<Self>, mpsc::Receiver<SocketEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        let socket = std::sync::Arc::new(Self { tx, state: Mutex::new(ReadyState::Open) });
        (socket, rx)
    }

    /// Mark the socket closed from the adapter side (peer went away).
    pub fn mark_closed(&self) {
        *self.state.lock().expect("socket state lock poisoned") = ReadyState::Closed;
    }
}

impl FrontendSocket for ChannelSocket {
    fn send(&self, text: String) {
        if self.ready_state() != ReadyState::Open {
            return;
        }
        // Best-effort: a full or disconnected channel drops the frame.
        let _ = self.tx.try_send(SocketEvent::Text(text));
    }

    fn close(&self, code: u16, reason: &str) {
        {
            let mut state = self.state.lock().expect("socket state lock poisoned");
            if *state == ReadyState::Closed {
                return;
            }
            *state = ReadyState::Closed;
        }
        let _ = self.tx.try_send(SocketEvent::Close { code, reason: reason.to_string() });
    }

    fn ready_state(&self) -> ReadyState {
        *self.state.lock().expect("socket state lock poisoned")
    }
}

impl std::fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSocket").field("state", &self.ready_state()).finish()
    }
}

/// Runtime-agnostic HTTP request handed to the core.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Uppercase HTTP method.
    pub method: String,
    /// Path plus query string (e.g. `/?token=abc`).
    pub url: String,
    /// Headers with lowercased names.
    headers: HashMap<String, String>,
    /// Raw request body.
    pub body: String,
}

impl HttpRequest {
    /// Build a request; header names are lowercased for lookup.
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        url: impl Into<String>,
        headers: impl IntoIterator<Item = (String, String)>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into().to_ascii_uppercase(),
            url: url.into(),
            headers: headers.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect(),
            body: body.into(),
        }
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// Extract the auth token: `Authorization: Bearer <t>` wins, then the
    /// `?token=` query parameter.
    #[must_use]
    pub fn auth_token(&self) -> Option<String> {
        if let Some(auth) = self.header("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ").or_else(|| auth.strip_prefix("bearer ")) {
                let token = token.trim();
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
        self.query_param("token")
    }

    /// Extract a query parameter from the URL.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.url.split_once('?')?.1;
        for pair in query.split('&') {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            if k == name && !v.is_empty() {
                return Some(v.to_string());
            }
        }
        None
    }

    /// Whether the client asked for an SSE stream.
    #[must_use]
    pub fn accepts_event_stream(&self) -> bool {
        self.header("accept").is_some_and(|a| a.contains("text/event-stream"))
    }
}

/// Runtime-agnostic HTTP response returned by the core.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers in emission order.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// JSON response with CORS headers.
    #[must_use]
    pub fn json(status: u16, body: &Value) -> Self {
        let mut response = Self {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        };
        response.apply_cors();
        response
    }

    /// Empty response with CORS headers (e.g. `202`, preflight `204`).
    #[must_use]
    pub fn empty(status: u16) -> Self {
        let mut response = Self { status, headers: Vec::new(), body: String::new() };
        response.apply_cors();
        response
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up a header (first match, case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn apply_cors(&mut self) {
        for (name, value) in cors_headers() {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }
}

/// The CORS header set applied to every MCP surface response.
#[must_use]
pub fn cors_headers() -> [(&'static str, &'static str); 4] {
    [
        ("Access-Control-Allow-Origin", "*"),
        ("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"),
        ("Access-Control-Allow-Headers", "Content-Type, Authorization, Mcp-Session-Id"),
        ("Access-Control-Expose-Headers", "Mcp-Session-Id"),
    ]
}

/// Sender half of an SSE stream; each string is one `data:` event payload.
pub type SseSender = mpsc::Sender<String>;

/// An open SSE stream handed back to the adapter.
///
/// The adapter forwards each received payload as one SSE `data:` event and
/// tears the HTTP response down when the channel closes. Keepalive comments
/// are the adapter's business.
#[derive(Debug)]
pub struct SseStream {
    /// Event payloads in emission order.
    pub events: mpsc::Receiver<String>,
}

impl SseStream {
    /// Create a connected (sender, stream) pair.
    #[must_use]
    pub fn channel() -> (SseSender, Self) {
        let (tx, rx) = mpsc::channel(defaults::SSE_CHANNEL_SIZE);
        (tx, Self { events: rx })
    }

    /// A stream that emits a single error payload and ends.
    #[must_use]
    pub fn error(message: &str) -> Self {
        let (tx, stream) = Self::channel();
        let _ = tx.try_send(serde_json::json!({ "error": message }).to_string());
        stream
    }
}

/// What the core wants the adapter to do with an HTTP exchange.
#[derive(Debug)]
pub enum HttpReply {
    /// Write a plain response.
    Response(HttpResponse),
    /// Hold the connection open as an SSE stream.
    EventStream(SseStream),
}
