//! Tool-call correlator.
//!
//! Forwards an MCP `tools/call` onto the owning frontend's WebSocket as a
//! `tool-call` frame and suspends the caller until the matching
//! `tool-response` arrives, the deadline passes, or the session goes away.
//! Responses are matched by `requestId` only; reordering is permitted and
//! concurrent calls to the same tool are independent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::bridge::session::Session;
use crate::error::{CallError, CallResult};
use crate::protocol::messages::ServerMessage;
use crate::scheduler::{Scheduler, TimerId};
use crate::transport::ReadyState;

struct Pending {
    session_id: String,
    responder: oneshot::Sender<CallResult<Value>>,
    timer: TimerId,
    started_at: Instant,
}

struct CorrelatorInner {
    scheduler: Arc<dyn Scheduler>,
    pending: Mutex<HashMap<String, Pending>>,
    shutdown: AtomicBool,
}

impl CorrelatorInner {
    /// Take one entry out of the table, cancelling its timer.
    fn take(&self, request_id: &str) -> Option<Pending> {
        let entry = self.pending.lock().expect("correlator lock poisoned").remove(request_id)?;
        self.scheduler.cancel(entry.timer);
        Some(entry)
    }

    fn fail(&self, request_id: &str, error: CallError) {
        if let Some(entry) = self.take(request_id) {
            let _ = entry.responder.send(Err(error));
        }
    }
}

/// Routes MCP tool invocations to frontends and correlates the responses.
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl Correlator {
    /// Create a correlator that arms its deadlines on `scheduler`.
    #[must_use]
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                scheduler,
                pending: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Forward `tool_name` to `session` and await the correlated response.
    pub async fn call(
        &self,
        session: &Session,
        tool_name: &str,
        tool_input: Option<Value>,
        timeout: Duration,
    ) -> CallResult<Value> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(CallError::Shutdown);
        }
        if session.socket.ready_state() != ReadyState::Open {
            return Err(CallError::SocketNotOpen);
        }

        let request_id = Uuid::new_v4().to_string();
        let (responder, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().expect("correlator lock poisoned");
            pending.insert(
                request_id.clone(),
                Pending {
                    session_id: session.id.clone(),
                    responder,
                    timer: 0,
                    started_at: Instant::now(),
                },
            );
        }

        let timer = {
            let inner = Arc::clone(&self.inner);
            let id = request_id.clone();
            self.inner.scheduler.schedule(
                timeout,
                Box::new(move || inner.fail(&id, CallError::Timeout(timeout))),
            )
        };
        {
            let mut pending = self.inner.pending.lock().expect("correlator lock poisoned");
            match pending.get_mut(&request_id) {
                Some(entry) => entry.timer = timer,
                // Resolved before the timer was even recorded.
                None => self.inner.scheduler.cancel(timer),
            }
        }

        tracing::debug!(
            session_id = %session.id,
            request_id = %request_id,
            tool = %tool_name,
            timeout_ms = timeout.as_millis() as u64,
            "Forwarding tool call"
        );

        session.socket.send(
            ServerMessage::ToolCall {
                request_id: request_id.clone(),
                tool_name: tool_name.to_string(),
                tool_input,
            }
            .to_frame(),
        );

        match rx.await {
            Ok(result) => result,
            // Responder dropped without an answer; treat as a lost session.
            Err(_) => Err(CallError::SessionClosed),
        }
    }

    /// Resolve a pending call from a `tool-response` frame.
    ///
    /// Returns false when the request id is unknown (already timed out, or
    /// never issued).
    pub fn resolve(&self, request_id: &str, result: Value) -> bool {
        match self.inner.take(request_id) {
            Some(entry) => {
                tracing::debug!(
                    request_id = %request_id,
                    elapsed_ms = entry.started_at.elapsed().as_millis() as u64,
                    "Tool response correlated"
                );
                let _ = entry.responder.send(Ok(result));
                true
            }
            None => {
                tracing::debug!(request_id = %request_id, "Dropping unmatched tool response");
                false
            }
        }
    }

    /// Fail every pending call owned by a session.
    pub fn fail_session(&self, session_id: &str) {
        let ids: Vec<String> = {
            let pending = self.inner.pending.lock().expect("correlator lock poisoned");
            pending
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            self.inner.fail(&id, CallError::SessionClosed);
        }
    }

    /// Reject everything and refuse new calls. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let ids: Vec<String> = {
            let pending = self.inner.pending.lock().expect("correlator lock poisoned");
            pending.keys().cloned().collect()
        };
        for id in ids {
            self.inner.fail(&id, CallError::Shutdown);
        }
    }

    /// Number of in-flight calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("correlator lock poisoned").len()
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator").field("pending", &self.pending_count()).finish()
    }
}
