//! Frontend-initiated agent query pipeline.
//!
//! A `query` frame turns into `PUT {agent_url}/query/{uuid}` against the
//! configured agent endpoint. The agent answers either with a single JSON
//! object or with an SSE stream of JSON events; both are pumped back onto
//! the originating WebSocket as `query_progress` / `query_complete` /
//! `query_failure` frames. Each query is an owned task with its own
//! cancellation token; session close is threaded into that token so orphan
//! queries are impossible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::bridge::session::Session;
use crate::config::BridgeConfig;
use crate::error::AgentError;
use crate::protocol::messages::ServerMessage;
use crate::scheduler::{Scheduler, TimerId};

/// Fields of an accepted `query` frame.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub uuid: String,
    pub prompt: String,
    pub context: Option<Value>,
    pub response_tool: Option<String>,
    pub tools: Option<Vec<String>>,
    pub restrict_tools: Option<bool>,
    pub timeout: Option<u64>,
}

struct ActiveQuery {
    session_id: String,
    auth_token: String,
    cancel: CancellationToken,
    timer: Mutex<Option<TimerId>>,
    timed_out: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
}

/// What ended a query, decided by the worker task.
enum Terminal {
    Complete { message: Option<Value>, tool_calls: Vec<Value> },
    Failure(AgentError),
    Cancelled { reason: Option<String> },
}

struct PipelineInner {
    config: Arc<BridgeConfig>,
    scheduler: Arc<dyn Scheduler>,
    http: ClientWithMiddleware,
    active: Mutex<HashMap<String, Arc<ActiveQuery>>>,
    shutdown: AtomicBool,
}

impl PipelineInner {
    fn count_for_token(&self, token: &str) -> usize {
        self.active
            .lock()
            .expect("query pipeline lock poisoned")
            .values()
            .filter(|q| q.auth_token == token)
            .count()
    }

    /// Remove a finished query and disarm its deadline.
    fn finish(&self, uuid: &str) -> Option<Arc<ActiveQuery>> {
        let entry = self.active.lock().expect("query pipeline lock poisoned").remove(uuid)?;
        if let Some(timer) = entry.timer.lock().expect("query pipeline lock poisoned").take() {
            self.scheduler.cancel(timer);
        }
        Some(entry)
    }
}

/// Proxies frontend queries to the agent endpoint with progress streaming.
#[derive(Clone)]
pub struct QueryPipeline {
    inner: Arc<PipelineInner>,
}

impl QueryPipeline {
    /// Build the pipeline and its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns error if HTTP client initialization fails.
    pub fn new(config: Arc<BridgeConfig>, scheduler: Arc<dyn Scheduler>) -> anyhow::Result<Self> {
        if let Some(agent_url) = config.agent_url.as_deref() {
            url::Url::parse(agent_url)
                .map_err(|e| anyhow::anyhow!("invalid agent URL '{agent_url}': {e}"))?;
        }

        let client = reqwest::Client::builder()
            .timeout(config.agent_request_timeout)
            .connect_timeout(config.agent_connect_timeout)
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(500), Duration::from_secs(10))
            .build_with_max_retries(config.agent_max_retries);

        let http = ClientBuilder::new(client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                scheduler,
                http,
                active: Mutex::new(HashMap::new()),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Handle a `query` frame from `session`.
    pub fn start(&self, session: &Arc<Session>, request: QueryRequest) {
        let uuid = request.uuid.clone();

        if self.inner.shutdown.load(Ordering::SeqCst) {
            session.socket.send(
                ServerMessage::QueryFailure { uuid, error: "Bridge shutting down".to_string() }
                    .to_frame(),
            );
            return;
        }

        if self.inner.config.agent_url.is_none() {
            session.socket.send(
                ServerMessage::QueryFailure {
                    uuid,
                    error: AgentError::NotConfigured.to_failure_message(),
                }
                .to_frame(),
            );
            return;
        }

        if let Some(max) = self.inner.config.max_in_flight_queries_per_token {
            if self.inner.count_for_token(&session.auth_token) >= max {
                tracing::warn!(
                    session_id = %session.id,
                    uuid = %uuid,
                    "Query rejected: token at in-flight limit"
                );
                session.socket.send(
                    ServerMessage::QueryFailure { uuid, error: "Query limit exceeded".to_string() }
                        .to_frame(),
                );
                return;
            }
        }

        let entry = Arc::new(ActiveQuery {
            session_id: session.id.clone(),
            auth_token: session.auth_token.clone(),
            cancel: CancellationToken::new(),
            timer: Mutex::new(None),
            timed_out: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
        });

        {
            let mut active = self.inner.active.lock().expect("query pipeline lock poisoned");
            if active.contains_key(&uuid) {
                drop(active);
                session.socket.send(
                    ServerMessage::QueryFailure {
                        uuid,
                        error: "Query already in flight".to_string(),
                    }
                    .to_frame(),
                );
                return;
            }
            active.insert(uuid.clone(), Arc::clone(&entry));
        }

        session.socket.send(ServerMessage::QueryAccepted { uuid: uuid.clone() }.to_frame());

        // Arm the overall deadline: expiry cancels the token with the
        // timed-out flag set, which the worker reports as a failure.
        let deadline =
            request.timeout.map_or(self.inner.config.query_timeout, Duration::from_millis);
        let timer = {
            let for_timer = Arc::clone(&entry);
            self.inner.scheduler.schedule(
                deadline,
                Box::new(move || {
                    for_timer.timed_out.store(true, Ordering::SeqCst);
                    for_timer.cancel.cancel();
                }),
            )
        };
        *entry.timer.lock().expect("query pipeline lock poisoned") = Some(timer);

        tracing::info!(session_id = %session.id, uuid = %uuid, "Query accepted");

        let pipeline = self.clone();
        let session = Arc::clone(session);
        let cancel = entry.cancel.clone();
        tokio::spawn(async move {
            let terminal = tokio::select! {
                () = cancel.cancelled() => {
                    let entry = pipeline.inner.finish(&request.uuid);
                    let timed_out = entry
                        .as_ref()
                        .is_some_and(|e| e.timed_out.load(Ordering::SeqCst));
                    if timed_out {
                        Terminal::Failure(AgentError::Timeout(deadline))
                    } else {
                        let reason = entry.and_then(|e| {
                            e.cancel_reason.lock().expect("query pipeline lock poisoned").clone()
                        });
                        Terminal::Cancelled { reason }
                    }
                }
                terminal = pipeline.run_agent_call(&session, &request) => {
                    pipeline.inner.finish(&request.uuid);
                    terminal
                }
            };

            let frame = match terminal {
                Terminal::Complete { message, tool_calls } => {
                    tracing::info!(uuid = %request.uuid, "Query complete");
                    ServerMessage::QueryComplete { uuid: request.uuid, message, tool_calls }
                }
                Terminal::Failure(error) => {
                    tracing::warn!(uuid = %request.uuid, error = %error, "Query failed");
                    ServerMessage::QueryFailure {
                        uuid: request.uuid,
                        error: error.to_failure_message(),
                    }
                }
                Terminal::Cancelled { reason } => {
                    tracing::info!(uuid = %request.uuid, "Query cancelled");
                    ServerMessage::QueryCancel { uuid: request.uuid, reason }
                }
            };
            session.socket.send(frame.to_frame());
        });
    }

    /// Handle a `query_cancel` frame.
    pub fn cancel(&self, session: &Session, uuid: &str, reason: Option<String>) {
        let entry = {
            let active = self.inner.active.lock().expect("query pipeline lock poisoned");
            active.get(uuid).filter(|q| q.session_id == session.id).cloned()
        };

        match entry {
            Some(entry) => {
                *entry.cancel_reason.lock().expect("query pipeline lock poisoned") = reason;
                entry.cancel.cancel();
            }
            None => {
                session.socket.send(
                    ServerMessage::QueryFailure {
                        uuid: uuid.to_string(),
                        error: "QueryNotFound".to_string(),
                    }
                    .to_frame(),
                );
            }
        }
    }

    /// Cancel every query owned by a closing session. The worker tasks wind
    /// down on their own; their final frames drop on the closed socket.
    pub fn cancel_session(&self, session_id: &str) {
        let entries: Vec<Arc<ActiveQuery>> = {
            let active = self.inner.active.lock().expect("query pipeline lock poisoned");
            active.values().filter(|q| q.session_id == session_id).cloned().collect()
        };
        for entry in entries {
            entry.cancel.cancel();
        }
    }

    /// In-flight query count for a token.
    #[must_use]
    pub fn in_flight_for_token(&self, token: &str) -> usize {
        self.inner.count_for_token(token)
    }

    /// Total in-flight query count.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.active.lock().expect("query pipeline lock poisoned").len()
    }

    /// Cancel everything and refuse new queries. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let entries: Vec<Arc<ActiveQuery>> = {
            let active = self.inner.active.lock().expect("query pipeline lock poisoned");
            active.values().cloned().collect()
        };
        for entry in entries {
            entry.cancel.cancel();
        }
    }

    /// Run the agent HTTP call and pump progress back to the frontend.
    async fn run_agent_call(&self, session: &Arc<Session>, request: &QueryRequest) -> Terminal {
        let Some(agent_url) = self.inner.config.agent_url.as_deref() else {
            return Terminal::Failure(AgentError::NotConfigured);
        };
        let url = format!("{}/query/{}", agent_url.trim_end_matches('/'), request.uuid);

        let mut body = json!({ "prompt": request.prompt });
        if let Some(context) = &request.context {
            body["context"] = context.clone();
        }
        if let Some(tool) = &request.response_tool {
            body["response_tool"] = json!(tool);
        }
        if let Some(tools) = &request.tools {
            body["tools"] = json!(tools);
        }
        if let Some(restrict) = request.restrict_tools {
            body["restrict_tools"] = json!(restrict);
        }

        let response = match self.inner.http.put(&url).json(&body).send().await {
            Ok(response) => response,
            Err(e) => return Terminal::Failure(e.into()),
        };

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Terminal::Failure(AgentError::status(status.as_u16(), message));
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        if is_event_stream {
            self.pump_event_stream(session, &request.uuid, response).await
        } else {
            match response.json::<AgentReply>().await {
                Ok(reply) => Terminal::Complete {
                    message: reply.message,
                    tool_calls: reply.tool_calls.unwrap_or_default(),
                },
                Err(e) => Terminal::Failure(e.into()),
            }
        }
    }

    /// Convert each agent SSE event into a frontend frame until a terminal
    /// event or end of stream.
    async fn pump_event_stream(
        &self,
        session: &Arc<Session>,
        uuid: &str,
        response: reqwest::Response,
    ) -> Terminal {
        let mut byte_stream = response.bytes_stream();
        // Buffer accumulates raw bytes between `\n\n` boundaries.
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => return Terminal::Failure(AgentError::Http(e)),
            };
            let Ok(text) = std::str::from_utf8(&chunk) else { continue };
            buffer.push_str(text);

            while let Some(pos) = buffer.find("\n\n") {
                let block = buffer[..pos].to_string();
                buffer.drain(..pos + 2);
                if let Some(terminal) = self.handle_event_block(session, uuid, &block) {
                    return terminal;
                }
            }
        }

        if let Some(terminal) = self.handle_event_block(session, uuid, &buffer) {
            return terminal;
        }

        // Stream ended without a terminal event; the agent is done.
        Terminal::Complete { message: None, tool_calls: Vec::new() }
    }

    /// Process one SSE event block. Returns a terminal outcome when the
    /// event ends the query.
    fn handle_event_block(
        &self,
        session: &Arc<Session>,
        uuid: &str,
        block: &str,
    ) -> Option<Terminal> {
        let mut data_lines: Vec<&str> = Vec::new();
        for line in block.lines() {
            if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.trim());
            }
            // `event:`/`id:`/`retry:` fields and `:` comments are ignored.
        }
        if data_lines.is_empty() {
            return None;
        }

        let event: AgentEvent = match serde_json::from_str(&data_lines.join("\n")) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(uuid = %uuid, error = %e, "Skipping unparseable agent event");
                return None;
            }
        };

        match event.kind.as_str() {
            "progress" => {
                session.socket.send(
                    ServerMessage::QueryProgress {
                        uuid: uuid.to_string(),
                        message: event.message.unwrap_or(Value::Null),
                    }
                    .to_frame(),
                );
                None
            }
            "complete" => Some(Terminal::Complete {
                message: event.message,
                tool_calls: event.tool_calls.unwrap_or_default(),
            }),
            "error" => Some(Terminal::Failure(AgentError::status(
                502,
                event.error.unwrap_or_else(|| "Agent reported an error".to_string()),
            ))),
            other => {
                tracing::debug!(uuid = %uuid, kind = %other, "Ignoring unknown agent event");
                None
            }
        }
    }
}

impl std::fmt::Debug for QueryPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryPipeline").field("in_flight", &self.in_flight()).finish()
    }
}

/// Terminal JSON body from a non-streaming agent.
#[derive(Debug, Deserialize)]
struct AgentReply {
    #[serde(default)]
    message: Option<Value>,
    #[serde(default, rename = "toolCalls", alias = "tool_calls")]
    tool_calls: Option<Vec<Value>>,
}

/// One `data:` event from a streaming agent.
#[derive(Debug, Deserialize)]
struct AgentEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    message: Option<Value>,
    #[serde(default, rename = "toolCalls", alias = "tool_calls")]
    tool_calls: Option<Vec<Value>>,
    #[serde(default)]
    error: Option<String>,
}
