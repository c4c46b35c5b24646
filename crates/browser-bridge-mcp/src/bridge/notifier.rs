//! MCP session store and SSE notifier.
//!
//! Each `initialize` mints an MCP session; a later `GET` with
//! `Accept: text/event-stream` attaches at most one SSE writer to it.
//! Notifications raised while no writer is attached land in a bounded
//! mailbox and are drained on attach, so a client that connects its stream
//! late still observes catalog changes. Notifications are delivered only to
//! sessions whose auth token matches the mutating frontend's token.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::defaults;
use crate::protocol::jsonrpc::list_changed_notification;
use crate::transport::{SseSender, SseStream};

struct McpSession {
    auth_token: String,
    sse: Option<SseSender>,
    mailbox: VecDeque<String>,
}

impl McpSession {
    fn queue(&mut self, payload: String) {
        if self.mailbox.len() >= defaults::NOTIFICATION_MAILBOX_SIZE {
            self.mailbox.pop_front();
        }
        self.mailbox.push_back(payload);
    }
}

/// Store of MCP sessions keyed by `Mcp-Session-Id`.
#[derive(Clone)]
pub struct Notifier {
    inner: Arc<RwLock<HashMap<String, McpSession>>>,
}

impl Notifier {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Mint a new MCP session for `auth_token`; returns its id.
    pub async fn create(&self, auth_token: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.inner.write().await.insert(
            id.clone(),
            McpSession {
                auth_token: auth_token.to_string(),
                sse: None,
                mailbox: VecDeque::new(),
            },
        );
        tracing::info!(mcp_session_id = %id, "MCP session created");
        id
    }

    /// The auth token behind an MCP session.
    pub async fn token_of(&self, mcp_session_id: &str) -> Option<String> {
        self.inner.read().await.get(mcp_session_id).map(|s| s.auth_token.clone())
    }

    /// Attach an SSE writer, replacing any previous one, and drain the
    /// mailbox into it. Returns `None` when the session does not exist.
    pub async fn attach(&self, mcp_session_id: &str) -> Option<SseStream> {
        let mut inner = self.inner.write().await;
        let session = inner.get_mut(mcp_session_id)?;

        let (tx, stream) = SseStream::channel();
        for payload in session.mailbox.drain(..) {
            let _ = tx.try_send(payload);
        }
        session.sse = Some(tx);

        tracing::debug!(mcp_session_id = %mcp_session_id, "SSE stream attached");
        Some(stream)
    }

    /// Release the SSE writer when the GET stream ends. The session itself
    /// survives until `DELETE` or shutdown.
    ///
    /// Only a writer whose channel is actually closed is released: a client
    /// that reconnected already replaced the writer, and the stale stream's
    /// teardown must not detach the live one.
    pub async fn detach(&self, mcp_session_id: &str) {
        if let Some(session) = self.inner.write().await.get_mut(mcp_session_id) {
            if session.sse.as_ref().is_some_and(|tx| tx.is_closed()) {
                session.sse = None;
                tracing::debug!(mcp_session_id = %mcp_session_id, "SSE stream detached");
            }
        }
    }

    /// Destroy an MCP session, releasing its writer first. Returns false
    /// when the id is unknown.
    pub async fn remove(&self, mcp_session_id: &str) -> bool {
        let removed = {
            let mut inner = self.inner.write().await;
            inner.remove(mcp_session_id).map(|mut session| session.sse.take()).is_some()
        };
        if removed {
            tracing::info!(mcp_session_id = %mcp_session_id, "MCP session removed");
        }
        removed
    }

    /// Emit `notifications/tools/list_changed` to every MCP session bound to
    /// `auth_token`. Sessions without an attached writer get the
    /// notification queued instead.
    pub async fn notify_list_changed(&self, auth_token: &str) {
        let payload = list_changed_notification();
        let targets: Vec<SseSender> = {
            let mut inner = self.inner.write().await;
            let mut targets = Vec::new();
            for session in inner.values_mut() {
                if session.auth_token != auth_token {
                    continue;
                }
                match &session.sse {
                    Some(tx) if !tx.is_closed() => targets.push(tx.clone()),
                    // No writer, or one whose stream already went away:
                    // queue for the next attach.
                    _ => session.queue(payload.clone()),
                }
            }
            targets
        };

        // Channel pushes happen outside the lock; a full or closed channel
        // drops the notification (best-effort).
        for tx in targets {
            let _ = tx.try_send(payload.clone());
        }
    }

    /// Drop every session and writer (for shutdown).
    pub async fn drain(&self) -> usize {
        let mut inner = self.inner.write().await;
        let count = inner.len();
        inner.clear();
        count
    }

    /// Live MCP session count.
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_is_unique() {
        let notifier = Notifier::new();
        let a = notifier.create("T").await;
        let b = notifier.create("T").await;
        assert_ne!(a, b);
        assert_eq!(notifier.len().await, 2);
        assert_eq!(notifier.token_of(&a).await.as_deref(), Some("T"));
    }

    #[tokio::test]
    async fn test_notification_reaches_attached_stream() {
        let notifier = Notifier::new();
        let id = notifier.create("T").await;
        let mut stream = notifier.attach(&id).await.expect("attach");

        notifier.notify_list_changed("T").await;

        let payload = stream.events.recv().await.expect("notification");
        assert_eq!(payload, list_changed_notification());
    }

    #[tokio::test]
    async fn test_notification_isolated_by_token() {
        let notifier = Notifier::new();
        let t_session = notifier.create("T").await;
        let u_session = notifier.create("U").await;
        let mut t_stream = notifier.attach(&t_session).await.unwrap();
        let mut u_stream = notifier.attach(&u_session).await.unwrap();

        notifier.notify_list_changed("T").await;

        assert!(t_stream.events.recv().await.is_some());
        assert!(u_stream.events.try_recv().is_err(), "other token must see nothing");
    }

    #[tokio::test]
    async fn test_mailbox_drained_on_attach() {
        let notifier = Notifier::new();
        let id = notifier.create("T").await;

        // Two catalog changes before the client opens its stream.
        notifier.notify_list_changed("T").await;
        notifier.notify_list_changed("T").await;

        let mut stream = notifier.attach(&id).await.unwrap();
        assert!(stream.events.recv().await.is_some());
        assert!(stream.events.recv().await.is_some());
        assert!(stream.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_mailbox_is_bounded() {
        let notifier = Notifier::new();
        let id = notifier.create("T").await;

        for _ in 0..(defaults::NOTIFICATION_MAILBOX_SIZE + 10) {
            notifier.notify_list_changed("T").await;
        }

        let mut stream = notifier.attach(&id).await.unwrap();
        let mut received = 0;
        while stream.events.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, defaults::NOTIFICATION_MAILBOX_SIZE);
    }

    #[tokio::test]
    async fn test_detach_queues_later_notifications() {
        let notifier = Notifier::new();
        let id = notifier.create("T").await;
        let stream = notifier.attach(&id).await.unwrap();
        drop(stream);
        notifier.detach(&id).await;

        notifier.notify_list_changed("T").await;

        let mut stream = notifier.attach(&id).await.unwrap();
        assert!(stream.events.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_remove_releases_everything() {
        let notifier = Notifier::new();
        let id = notifier.create("T").await;
        let mut stream = notifier.attach(&id).await.unwrap();

        assert!(notifier.remove(&id).await);
        assert!(!notifier.remove(&id).await, "second remove is a no-op");
        assert!(notifier.attach(&id).await.is_none());

        // Writer released: the stream ends.
        assert_eq!(stream.events.recv().await, None);
    }
}
