//! WebSocket endpoint for frontend sessions.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::bridge::Bridge;
use crate::transport::{ChannelSocket, FrontendSocket, SocketEvent};

/// Query parameters of the WebSocket URL.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Client-chosen session id (`?session=`).
    session: Option<String>,
}

/// Upgrade handler for `GET /ws`.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<Arc<Bridge>>,
    Query(query): Query<WsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge, query.session))
}

async fn handle_socket(socket: WebSocket, bridge: Arc<Bridge>, session_param: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ChannelSocket::new();

    let conn_id = bridge.on_ws_connect(
        session_param.as_deref(),
        Arc::clone(&handle) as Arc<dyn FrontendSocket>,
    );

    // Pump core-emitted frames out to the real socket. Runs even for a
    // refused connection so the close frame reaches the client.
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound.recv().await {
            match event {
                SocketEvent::Text(text) => {
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                SocketEvent::Close { code, reason } => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let Some(conn_id) = conn_id else {
        let _ = writer.await;
        return;
    };

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                bridge.on_ws_message(&conn_id, &text).await;
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Ping/pong and binary frames carry no bridge meaning.
            Ok(_) => {}
        }
    }

    handle.mark_closed();
    bridge.on_ws_close(&conn_id).await;
    writer.abort();
}
