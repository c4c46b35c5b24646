//! Configuration for the bridge server.

use std::time::Duration;

/// Built-in defaults.
pub mod defaults {
    use std::time::Duration;

    /// Server name published in `serverInfo`.
    pub const SERVER_NAME: &str = "browser-bridge-mcp";

    /// Server description published in `serverInfo`.
    pub const SERVER_DESCRIPTION: &str =
        "Bridge exposing browser-tab tools to headless MCP clients";

    /// MCP protocol version answered on `initialize`.
    pub const PROTOCOL_VERSION: &str = "2024-11-05";

    /// Deadline for a frontend to answer a forwarded tool call.
    pub const TOOL_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    /// Overall deadline for a frontend-originated agent query.
    pub const QUERY_TIMEOUT: Duration = Duration::from_secs(300);

    /// Period of the session sweep.
    pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

    /// SSE keepalive comment period (emitted by the HTTP adapter).
    pub const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    /// Agent HTTP request timeout.
    pub const AGENT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

    /// Agent connection timeout.
    pub const AGENT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Transient-failure retries for agent requests.
    pub const AGENT_MAX_RETRIES: u32 = 2;

    /// Capacity of each MCP session's pending-notification mailbox.
    pub const NOTIFICATION_MAILBOX_SIZE: usize = 16;

    /// Capacity of each attached SSE writer channel.
    pub const SSE_CHANNEL_SIZE: usize = 64;
}

/// Policy applied when a token reaches `max_sessions_per_token`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SessionLimitPolicy {
    /// Refuse the new session and close its socket
    #[default]
    Reject,
    /// Evict the token's oldest session, then admit the new one
    CloseOldest,
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Server name published in `serverInfo`.
    pub name: String,

    /// Server description published in `serverInfo`.
    pub description: String,

    /// Optional icon URL published in `serverInfo` and on `GET /`.
    pub icon: Option<String>,

    /// Base URL of the agent endpoint for frontend-originated queries.
    pub agent_url: Option<String>,

    /// Maximum live frontend sessions per auth token.
    pub max_sessions_per_token: Option<usize>,

    /// What to do when the per-token session quota is hit.
    pub on_session_limit_exceeded: SessionLimitPolicy,

    /// Maximum concurrent queries per auth token.
    pub max_in_flight_queries_per_token: Option<usize>,

    /// Absolute cap on a frontend session's age.
    pub session_max_duration: Option<Duration>,

    /// Period of the session sweep.
    pub session_sweep_interval: Duration,

    /// Deadline for a frontend to answer a forwarded tool call.
    pub tool_call_timeout: Duration,

    /// Default overall deadline for a query (a `query` message may shorten it).
    pub query_timeout: Duration,

    /// Agent HTTP request timeout.
    pub agent_request_timeout: Duration,

    /// Agent connection timeout.
    pub agent_connect_timeout: Duration,

    /// Transient-failure retries for agent requests.
    pub agent_max_retries: u32,
}

impl BridgeConfig {
    /// Create a configuration with the given identity and all limits off.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            icon: None,
            agent_url: None,
            max_sessions_per_token: None,
            on_session_limit_exceeded: SessionLimitPolicy::Reject,
            max_in_flight_queries_per_token: None,
            session_max_duration: None,
            session_sweep_interval: defaults::SESSION_SWEEP_INTERVAL,
            tool_call_timeout: defaults::TOOL_CALL_TIMEOUT,
            query_timeout: defaults::QUERY_TIMEOUT,
            agent_request_timeout: defaults::AGENT_REQUEST_TIMEOUT,
            agent_connect_timeout: defaults::AGENT_CONNECT_TIMEOUT,
            agent_max_retries: defaults::AGENT_MAX_RETRIES,
        }
    }

    /// Create a test configuration with short timeouts and a fast sweep.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            tool_call_timeout: Duration::from_millis(200),
            query_timeout: Duration::from_secs(5),
            session_sweep_interval: Duration::from_millis(50),
            agent_request_timeout: Duration::from_secs(2),
            agent_connect_timeout: Duration::from_secs(1),
            agent_max_retries: 0,
            ..Self::new("test-bridge", "bridge under test")
        }
    }

    /// Set the agent endpoint.
    #[must_use]
    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = Some(url.into());
        self
    }

    /// Set the per-token session quota and its policy.
    #[must_use]
    pub fn with_session_limit(mut self, max: usize, policy: SessionLimitPolicy) -> Self {
        self.max_sessions_per_token = Some(max);
        self.on_session_limit_exceeded = policy;
        self
    }

    /// Set the per-token query quota.
    #[must_use]
    pub fn with_query_limit(mut self, max: usize) -> Self {
        self.max_in_flight_queries_per_token = Some(max);
        self
    }

    /// Set the absolute session age cap.
    #[must_use]
    pub fn with_session_max_duration(mut self, max: Duration) -> Self {
        self.session_max_duration = Some(max);
        self
    }

    /// Check if an agent endpoint is configured.
    #[must_use]
    pub const fn has_agent(&self) -> bool {
        self.agent_url.is_some()
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new(defaults::SERVER_NAME, defaults::SERVER_DESCRIPTION)
    }
}
