//! Bridge core.
//!
//! Owns every piece of process-wide state (session registry, MCP session
//! store, correlator, query pipeline) and exposes the entry points a host
//! adapter drives: `on_ws_connect` / `on_ws_message` / `on_ws_close` for the
//! frontend surface and `handle_http` for the MCP surface. Multiple bridge
//! instances in one process are independent.

pub mod correlator;
pub mod mcp_handler;
pub mod notifier;
pub mod query;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde_json::json;
use uuid::Uuid;

use crate::config::BridgeConfig;
use crate::error::ErrorCode;
use crate::protocol::messages::{ClientMessage, ServerMessage};
use crate::scheduler::{Scheduler, TimerId, TokioScheduler};
use crate::transport::{FrontendSocket, HttpReply, HttpRequest, HttpResponse};

use correlator::Correlator;
use mcp_handler::McpHandler;
use notifier::Notifier;
use query::{QueryPipeline, QueryRequest};
use session::{AdmitOutcome, AdmitParams, Registry, Session};

#[derive(Clone)]
struct Connection {
    session_id: String,
    socket: Arc<dyn FrontendSocket>,
    authenticated: bool,
}

/// The bridge instance.
pub struct Bridge {
    config: Arc<BridgeConfig>,
    scheduler: Arc<dyn Scheduler>,
    registry: Arc<Registry>,
    correlator: Correlator,
    notifier: Notifier,
    queries: QueryPipeline,
    mcp: McpHandler,
    connections: Mutex<HashMap<String, Connection>>,
    sweep_timer: Mutex<Option<TimerId>>,
    closed: AtomicBool,
}

impl Bridge {
    /// Create a bridge on the default timer-backed scheduler.
    ///
    /// # Errors
    ///
    /// Returns error if the agent HTTP client cannot be built.
    pub fn new(config: BridgeConfig) -> anyhow::Result<Arc<Self>> {
        Self::with_scheduler(config, Arc::new(TokioScheduler::new()))
    }

    /// Create a bridge on an explicit scheduler.
    ///
    /// # Errors
    ///
    /// Returns error if the agent HTTP client cannot be built.
    pub fn with_scheduler(
        config: BridgeConfig,
        scheduler: Arc<dyn Scheduler>,
    ) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let registry = Arc::new(Registry::new());
        let correlator = Correlator::new(Arc::clone(&scheduler));
        let notifier = Notifier::new();
        let queries = QueryPipeline::new(Arc::clone(&config), Arc::clone(&scheduler))?;
        let mcp = McpHandler::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            correlator.clone(),
            notifier.clone(),
        );

        let bridge = Arc::new(Self {
            config,
            scheduler,
            registry,
            correlator,
            notifier,
            queries,
            mcp,
            connections: Mutex::new(HashMap::new()),
            sweep_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        bridge.start_sweep(&bridge);
        Ok(bridge)
    }

    fn start_sweep(&self, self_arc: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self_arc);
        let timer = self.scheduler.schedule_interval(
            self.config.session_sweep_interval,
            Arc::new(move || {
                if let Some(bridge) = weak.upgrade() {
                    tokio::spawn(async move { bridge.sweep().await });
                }
            }),
        );
        *self.sweep_timer.lock().expect("bridge lock poisoned") = Some(timer);
    }

    /// Close sessions that outlived `session_max_duration`.
    async fn sweep(&self) {
        let Some(max) = self.config.session_max_duration else { return };
        for session in self.registry.expired(max).await {
            tracing::info!(session_id = %session.id, "Session exceeded max duration");
            self.close_session(&session.id, Some((1008, "Session duration exceeded"))).await;
        }
    }

    /// Shared state accessors, mainly for adapters and tests.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The query pipeline.
    #[must_use]
    pub fn queries(&self) -> &QueryPipeline {
        &self.queries
    }

    /// The tool-call correlator.
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// The configuration this bridge runs with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // -----------------------------------------------------------------
    // Frontend WebSocket surface
    // -----------------------------------------------------------------

    /// A WebSocket connected. `session_param` is the `?session=` value; a
    /// missing one is refused with close `1008`. Returns the connection id
    /// to use for subsequent message/close callbacks.
    pub fn on_ws_connect(
        &self,
        session_param: Option<&str>,
        socket: Arc<dyn FrontendSocket>,
    ) -> Option<String> {
        if self.closed.load(Ordering::SeqCst) {
            socket.close(1001, "Bridge shutting down");
            return None;
        }
        let Some(session_id) = session_param.filter(|s| !s.is_empty()) else {
            socket.close(1008, "Missing session parameter");
            return None;
        };

        let conn_id = Uuid::new_v4().to_string();
        self.connections.lock().expect("bridge lock poisoned").insert(
            conn_id.clone(),
            Connection { session_id: session_id.to_string(), socket, authenticated: false },
        );

        tracing::debug!(session_id = %session_id, conn_id = %conn_id, "WebSocket connected");
        Some(conn_id)
    }

    /// One text frame arrived on a connection.
    pub async fn on_ws_message(&self, conn_id: &str, text: &str) {
        let Some(conn) = self.connection(conn_id) else { return };

        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "Dropping unparseable frame");
                return;
            }
        };

        if let ClientMessage::Authenticate { .. } = &message {
            self.handle_authenticate(conn_id, &conn, message).await;
            return;
        }

        if !conn.authenticated {
            conn.socket.send(
                ServerMessage::auth_failed(
                    ErrorCode::MissingAuthentication,
                    "Authenticate before sending other messages",
                )
                .to_frame(),
            );
            return;
        }

        let Some(session) = self.registry.get(&conn.session_id).await else { return };

        match message {
            ClientMessage::Authenticate { .. } => unreachable!("handled above"),
            ClientMessage::RegisterTool { tool } => {
                let tool_name = tool.name.clone();
                match self.registry.register_tool(&session, tool).await {
                    Ok(()) => {
                        tracing::info!(session_id = %session.id, tool = %tool_name, "Tool registered");
                        self.notifier.notify_list_changed(&session.auth_token).await;
                    }
                    Err(message) => {
                        tracing::warn!(session_id = %session.id, tool = %tool_name, "Schema conflict");
                        session.socket.send(
                            ServerMessage::RegistrationError {
                                tool_name,
                                code: ErrorCode::ToolSchemaConflict,
                                message,
                            }
                            .to_frame(),
                        );
                    }
                }
                session.touch();
            }
            ClientMessage::Activity { .. } => session.touch(),
            ClientMessage::ToolResponse { request_id, result } => {
                self.correlator.resolve(&request_id, result);
                session.touch();
            }
            ClientMessage::Query {
                uuid,
                prompt,
                context,
                response_tool,
                tools,
                restrict_tools,
                timeout,
            } => {
                session.touch();
                self.queries.start(
                    &session,
                    QueryRequest {
                        uuid,
                        prompt,
                        context,
                        response_tool,
                        tools,
                        restrict_tools,
                        timeout,
                    },
                );
            }
            ClientMessage::QueryCancel { uuid, reason } => {
                self.queries.cancel(&session, &uuid, reason);
            }
        }
    }

    /// A WebSocket disconnected.
    pub async fn on_ws_close(&self, conn_id: &str) {
        let conn = self.connections.lock().expect("bridge lock poisoned").remove(conn_id);
        let Some(conn) = conn else { return };

        tracing::debug!(session_id = %conn.session_id, conn_id = %conn_id, "WebSocket closed");
        if conn.authenticated {
            // The socket is already gone; only the state needs tearing down.
            self.close_session(&conn.session_id, None).await;
        }
    }

    fn connection(&self, conn_id: &str) -> Option<Connection> {
        self.connections.lock().expect("bridge lock poisoned").get(conn_id).cloned()
    }

    async fn handle_authenticate(&self, conn_id: &str, conn: &Connection, message: ClientMessage) {
        let ClientMessage::Authenticate {
            auth_token,
            session_name,
            origin,
            page_title,
            user_agent,
            timestamp: _,
        } = message
        else {
            return;
        };

        let params = AdmitParams {
            session_id: conn.session_id.clone(),
            auth_token,
            session_name,
            origin,
            page_title,
            user_agent,
        };

        let outcome = self
            .registry
            .admit(
                params,
                Arc::clone(&conn.socket),
                self.config.max_sessions_per_token,
                self.config.on_session_limit_exceeded,
            )
            .await;

        match outcome {
            AdmitOutcome::Admitted { session, evicted } => {
                {
                    let mut map = self.connections.lock().expect("bridge lock poisoned");
                    if let Some(entry) = map.get_mut(conn_id) {
                        entry.authenticated = true;
                    }
                }

                if let Some(old) = evicted {
                    tracing::info!(
                        session_id = %old.id,
                        token = %old.auth_token,
                        "Evicting oldest session for token quota"
                    );
                    self.teardown_session(&old, Some((1008, "Session limit exceeded"))).await;
                }

                conn.socket.send(ServerMessage::authenticated().to_frame());
                self.notifier.notify_list_changed(&session.auth_token).await;
            }
            AdmitOutcome::Rejected(rejection) => {
                tracing::warn!(
                    session_id = %conn.session_id,
                    code = %rejection.code,
                    "Authentication rejected"
                );
                // The failure frame goes out before any close so the client
                // learns not to retry.
                conn.socket
                    .send(ServerMessage::auth_failed(rejection.code, rejection.error).to_frame());
                if let Some((code, reason)) = rejection.close {
                    conn.socket.close(code, &reason);
                }
            }
        }
    }

    /// Remove a session from the registry and tear its work down.
    async fn close_session(&self, session_id: &str, close: Option<(u16, &str)>) {
        if let Some(session) = self.registry.remove(session_id).await {
            self.teardown_session(&session, close).await;
        }
    }

    async fn teardown_session(&self, session: &Arc<Session>, close: Option<(u16, &str)>) {
        self.correlator.fail_session(&session.id);
        self.queries.cancel_session(&session.id);
        if let Some((code, reason)) = close {
            session.socket.close(code, reason);
        }
        self.notifier.notify_list_changed(&session.auth_token).await;
    }

    // -----------------------------------------------------------------
    // MCP HTTP surface
    // -----------------------------------------------------------------

    /// Handle one HTTP exchange against the MCP surface.
    pub async fn handle_http(&self, request: &HttpRequest) -> HttpReply {
        if self.closed.load(Ordering::SeqCst) {
            return HttpReply::Response(HttpResponse::json(
                503,
                &json!({ "error": ErrorCode::BridgeShutdown.as_str() }),
            ));
        }
        self.mcp.handle(request).await
    }

    /// Release an SSE writer after its GET stream ended.
    pub async fn on_sse_closed(&self, mcp_session_id: &str) {
        self.notifier.detach(mcp_session_id).await;
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Shut the bridge down: cancel all timers, reject all pending work,
    /// close every socket and SSE stream. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Bridge shutting down");

        if let Some(timer) = self.sweep_timer.lock().expect("bridge lock poisoned").take() {
            self.scheduler.cancel_interval(timer);
        }
        self.correlator.shutdown();
        self.queries.shutdown();
        self.scheduler.dispose();

        for session in self.registry.drain().await {
            session.socket.close(1001, "Bridge shutting down");
        }

        let connections: Vec<Connection> = {
            let mut map = self.connections.lock().expect("bridge lock poisoned");
            map.drain().map(|(_, c)| c).collect()
        };
        for conn in connections {
            if !conn.authenticated {
                conn.socket.close(1001, "Bridge shutting down");
            }
        }

        let dropped = self.notifier.drain().await;
        tracing::info!(mcp_sessions = dropped, "Bridge shut down");
    }

    /// Whether `close()` has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge").field("closed", &self.is_closed()).finish()
    }
}
