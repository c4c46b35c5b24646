//! Frontend session registry.
//!
//! In-memory state for every authenticated WebSocket: the primary session
//! map plus two secondary indexes (auth token -> sessions, (token, name) ->
//! session) that enforce uniqueness and quotas. All methods only mutate
//! maps; socket I/O for admission results happens in the caller, outside any
//! lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::config::SessionLimitPolicy;
use crate::error::ErrorCode;
use crate::protocol::messages::ToolDefinition;
use crate::transport::FrontendSocket;

/// One authenticated frontend session.
pub struct Session {
    /// Client-chosen session identifier, unique across live sessions.
    pub id: String,
    /// Token grouping this session with its tenant.
    pub auth_token: String,
    /// Optional display name, unique within the token while live.
    pub name: Option<String>,
    /// Page origin. Advisory.
    pub origin: String,
    /// Page title. Advisory.
    pub page_title: Option<String>,
    /// Browser user agent. Advisory.
    pub user_agent: Option<String>,
    /// Monotonic admission time (drives eviction and the sweep).
    pub connected_at: Instant,
    /// Wall-clock admission time (reported by `list_sessions`).
    pub connected_at_utc: DateTime<Utc>,
    /// Outbound socket handle.
    pub socket: Arc<dyn FrontendSocket>,

    last_activity: Mutex<(Instant, DateTime<Utc>)>,
    tools: Mutex<HashMap<String, ToolDefinition>>,
}

impl Session {
    fn new(params: AdmitParams, auth_token: String, socket: Arc<dyn FrontendSocket>) -> Self {
        let now = Instant::now();
        let now_utc = Utc::now();
        Self {
            id: params.session_id,
            auth_token,
            name: params.session_name,
            origin: params.origin.unwrap_or_default(),
            page_title: params.page_title,
            user_agent: params.user_agent,
            connected_at: now,
            connected_at_utc: now_utc,
            socket,
            last_activity: Mutex::new((now, now_utc)),
            tools: Mutex::new(HashMap::new()),
        }
    }

    /// Refresh the activity timestamp.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session lock poisoned") = (Instant::now(), Utc::now());
    }

    /// Wall-clock time of the last activity.
    #[must_use]
    pub fn last_activity_utc(&self) -> DateTime<Utc> {
        self.last_activity.lock().expect("session lock poisoned").1
    }

    /// Age of this session.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Record a tool, replacing any previous definition under this session.
    pub fn insert_tool(&self, tool: ToolDefinition) {
        self.tools.lock().expect("session lock poisoned").insert(tool.name.clone(), tool);
    }

    /// Look up one tool.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.lock().expect("session lock poisoned").get(name).cloned()
    }

    /// Whether this session exposes a tool.
    #[must_use]
    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.lock().expect("session lock poisoned").contains_key(name)
    }

    /// Snapshot of the catalog, sorted by name for stable listings.
    #[must_use]
    pub fn tools_snapshot(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> =
            self.tools.lock().expect("session lock poisoned").values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Parameters of an `authenticate` attempt.
#[derive(Debug, Clone, Default)]
pub struct AdmitParams {
    pub session_id: String,
    pub auth_token: Option<String>,
    pub session_name: Option<String>,
    pub origin: Option<String>,
    pub page_title: Option<String>,
    pub user_agent: Option<String>,
}

/// Why an `authenticate` attempt was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitRejection {
    /// Wire code for the `authentication-failed` message.
    pub code: ErrorCode,
    /// Human-readable message.
    pub error: String,
    /// Close the socket with this (code, reason) after the failure message.
    pub close: Option<(u16, String)>,
}

/// Result of an `authenticate` attempt.
#[derive(Debug)]
pub enum AdmitOutcome {
    /// Session created; `evicted` holds a session displaced by the
    /// `close_oldest` policy whose socket the caller must close.
    Admitted { session: Arc<Session>, evicted: Option<Arc<Session>> },
    /// Refused; the caller reports the failure and optionally closes.
    Rejected(AdmitRejection),
}

#[derive(Default)]
struct Indexes {
    sessions: HashMap<String, Arc<Session>>,
    by_token: HashMap<String, Vec<String>>,
    by_name: HashMap<(String, String), String>,
}

impl Indexes {
    fn insert(&mut self, session: &Arc<Session>) {
        self.sessions.insert(session.id.clone(), Arc::clone(session));
        self.by_token.entry(session.auth_token.clone()).or_default().push(session.id.clone());
        if let Some(name) = &session.name {
            self.by_name.insert((session.auth_token.clone(), name.clone()), session.id.clone());
        }
    }

    fn remove(&mut self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.remove(session_id)?;
        if let Some(ids) = self.by_token.get_mut(&session.auth_token) {
            ids.retain(|id| id != session_id);
            if ids.is_empty() {
                self.by_token.remove(&session.auth_token);
            }
        }
        if let Some(name) = &session.name {
            self.by_name.remove(&(session.auth_token.clone(), name.clone()));
        }
        Some(session)
    }

    fn token_sessions(&self, token: &str) -> Vec<Arc<Session>> {
        self.by_token
            .get(token)
            .map(|ids| ids.iter().filter_map(|id| self.sessions.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

/// Session registry with token and name indexes.
pub struct Registry {
    inner: RwLock<Indexes>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: RwLock::new(Indexes::default()) }
    }

    /// Run the `authenticate` admission rules, in order.
    pub async fn admit(
        &self,
        params: AdmitParams,
        socket: Arc<dyn FrontendSocket>,
        max_sessions_per_token: Option<usize>,
        limit_policy: SessionLimitPolicy,
    ) -> AdmitOutcome {
        let mut inner = self.inner.write().await;

        if inner.sessions.contains_key(&params.session_id) {
            return AdmitOutcome::Rejected(AdmitRejection {
                code: ErrorCode::SessionIdInUse,
                error: "Session id already in use".to_string(),
                close: None,
            });
        }

        let Some(auth_token) = params.auth_token.clone().filter(|t| !t.is_empty()) else {
            return AdmitOutcome::Rejected(AdmitRejection {
                code: ErrorCode::MissingAuthentication,
                error: "Authentication token required".to_string(),
                close: None,
            });
        };

        if let Some(name) = &params.session_name {
            if inner.by_name.contains_key(&(auth_token.clone(), name.clone())) {
                return AdmitOutcome::Rejected(AdmitRejection {
                    code: ErrorCode::SessionNameAlreadyInUse,
                    error: "Session name already in use".to_string(),
                    close: Some((1008, "Session name already in use".to_string())),
                });
            }
        }

        let mut evicted = None;
        if let Some(max) = max_sessions_per_token {
            let current = inner.token_sessions(&auth_token);
            if current.len() >= max {
                match limit_policy {
                    SessionLimitPolicy::Reject => {
                        return AdmitOutcome::Rejected(AdmitRejection {
                            code: ErrorCode::SessionLimitExceeded,
                            error: "Session limit exceeded".to_string(),
                            close: Some((1008, "Session limit exceeded".to_string())),
                        });
                    }
                    SessionLimitPolicy::CloseOldest => {
                        if let Some(oldest) =
                            current.iter().min_by_key(|s| s.connected_at).cloned()
                        {
                            inner.remove(&oldest.id);
                            evicted = Some(oldest);
                        }
                    }
                }
            }
        }

        let session = Arc::new(Session::new(params, auth_token, socket));
        inner.insert(&session);

        tracing::info!(
            session_id = %session.id,
            token = %session.auth_token,
            name = ?session.name,
            "Frontend session admitted"
        );

        AdmitOutcome::Admitted { session, evicted }
    }

    /// Register a tool, enforcing per-token schema agreement.
    ///
    /// Rejects when another live session under the same token already has a
    /// tool with this name and a structurally different schema.
    pub async fn register_tool(
        &self,
        session: &Arc<Session>,
        tool: ToolDefinition,
    ) -> Result<(), String> {
        let inner = self.inner.read().await;
        for peer in inner.token_sessions(&session.auth_token) {
            if peer.id == session.id {
                continue;
            }
            if let Some(existing) = peer.tool(&tool.name) {
                if !existing.schema_eq(&tool) {
                    return Err(format!(
                        "Tool '{}' is already registered by session '{}' with a different schema",
                        tool.name, peer.id
                    ));
                }
            }
        }
        drop(inner);

        session.insert_tool(tool);
        Ok(())
    }

    /// Look up a session.
    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.read().await.sessions.get(session_id).cloned()
    }

    /// All live sessions for a token.
    pub async fn sessions_for_token(&self, token: &str) -> Vec<Arc<Session>> {
        self.inner.read().await.token_sessions(token)
    }

    /// Remove a session from every index; the caller tears down its calls,
    /// queries, and socket.
    pub async fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        let removed = self.inner.write().await.remove(session_id);
        if let Some(session) = &removed {
            tracing::info!(session_id = %session.id, "Frontend session removed");
        }
        removed
    }

    /// Sessions whose age exceeds `max_duration` (for the sweep).
    pub async fn expired(&self, max_duration: Duration) -> Vec<Arc<Session>> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| s.age() > max_duration)
            .cloned()
            .collect()
    }

    /// Remove every session (for shutdown); returns them for teardown.
    pub async fn drain(&self) -> Vec<Arc<Session>> {
        let mut inner = self.inner.write().await;
        let sessions: Vec<Arc<Session>> = inner.sessions.values().cloned().collect();
        inner.sessions.clear();
        inner.by_token.clear();
        inner.by_name.clear();
        sessions
    }

    /// Live session count.
    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").finish()
    }
}
