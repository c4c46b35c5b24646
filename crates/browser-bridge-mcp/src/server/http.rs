//! HTTP and SSE plumbing for the MCP surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::bridge::Bridge;
use crate::bridge::mcp_handler::MCP_SESSION_HEADER;
use crate::config::defaults;
use crate::transport::{HttpReply, HttpRequest, cors_headers};

/// Single entry point for `POST` / `GET` / `DELETE` / `OPTIONS` on `/`.
pub async fn handle_mcp(
    State(bridge): State<Arc<Bridge>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    let request = to_core_request(&method, &uri, &headers, body);
    // An SSE attach is about to replace any previous writer; remember the
    // session so the stream can detach itself when the client goes away.
    let sse_session = request.header(MCP_SESSION_HEADER).map(String::from);

    match bridge.handle_http(&request).await {
        HttpReply::Response(response) => to_axum_response(&response),
        HttpReply::EventStream(stream) => {
            let guard = SseGuard { bridge, mcp_session_id: sse_session };
            let events = ReceiverStream::new(stream.events).map(move |payload| {
                let _hold = &guard;
                Ok::<_, Infallible>(Event::default().data(payload))
            });

            let mut response = Sse::new(events)
                .keep_alive(
                    KeepAlive::new()
                        .interval(defaults::SSE_KEEPALIVE_INTERVAL)
                        .text("keepalive"),
                )
                .into_response();
            // The SSE attach is part of the MCP surface; it carries the same
            // CORS set as every plain response.
            apply_cors(response.headers_mut());
            response
        }
    }
}

fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in cors_headers() {
        if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
            headers.append(name, value);
        }
    }
}

/// Detaches the SSE writer when the response stream is dropped.
struct SseGuard {
    bridge: Arc<Bridge>,
    mcp_session_id: Option<String>,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        if let Some(id) = self.mcp_session_id.take() {
            let bridge = Arc::clone(&self.bridge);
            tokio::spawn(async move { bridge.on_sse_closed(&id).await });
        }
    }
}

fn to_core_request(method: &Method, uri: &Uri, headers: &HeaderMap, body: String) -> HttpRequest {
    let url = uri.path_and_query().map_or_else(|| uri.path().to_string(), |pq| pq.to_string());
    let header_pairs = headers.iter().filter_map(|(name, value)| {
        value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
    });
    HttpRequest::new(method.as_str(), url, header_pairs, body)
}

fn to_axum_response(response: &crate::transport::HttpResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::builder().status(status);

    if let Some(headers) = out.headers_mut() {
        for (name, value) in &response.headers {
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), HeaderValue::from_str(value))
            {
                headers.append(name, value);
            }
        }
    }

    out.body(Body::from(response.body.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}
