//! Browser Bridge MCP Server - Entry Point

use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use browser_bridge_mcp::config::defaults;
use browser_bridge_mcp::{Bridge, BridgeConfig, SessionLimitPolicy, server};

#[derive(Parser, Debug)]
#[command(name = "browser-bridge-mcp")]
#[command(about = "MCP bridge server exposing browser-tab tools to headless clients")]
#[command(version)]
struct Cli {
    /// Bind host
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: String,

    /// HTTP port (MCP surface and WebSocket endpoint)
    #[arg(long, default_value = "8800", env = "PORT")]
    port: u16,

    /// Server name published in serverInfo
    #[arg(long, default_value = defaults::SERVER_NAME)]
    name: String,

    /// Server description published in serverInfo
    #[arg(long, default_value = defaults::SERVER_DESCRIPTION)]
    description: String,

    /// Icon URL published in serverInfo
    #[arg(long, env = "BRIDGE_ICON")]
    icon: Option<String>,

    /// Agent endpoint for frontend-originated queries
    #[arg(long, env = "AGENT_URL")]
    agent_url: Option<String>,

    /// Maximum live sessions per auth token
    #[arg(long, env = "MAX_SESSIONS_PER_TOKEN")]
    max_sessions_per_token: Option<usize>,

    /// Policy when the per-token session quota is hit
    #[arg(long, value_enum, default_value = "reject")]
    on_session_limit_exceeded: SessionLimitPolicy,

    /// Maximum concurrent queries per auth token
    #[arg(long, env = "MAX_IN_FLIGHT_QUERIES_PER_TOKEN")]
    max_in_flight_queries_per_token: Option<usize>,

    /// Absolute cap on a session's age, in milliseconds
    #[arg(long, env = "SESSION_MAX_DURATION_MS")]
    session_max_duration_ms: Option<u64>,

    /// Deadline for a frontend to answer a tool call, in milliseconds
    #[arg(long, default_value = "30000")]
    tool_call_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(log_level: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}

fn build_config(cli: &Cli) -> BridgeConfig {
    let mut config = BridgeConfig::new(cli.name.clone(), cli.description.clone());
    config.icon = cli.icon.clone();
    config.agent_url = cli.agent_url.clone();
    config.max_sessions_per_token = cli.max_sessions_per_token;
    config.on_session_limit_exceeded = cli.on_session_limit_exceeded;
    config.max_in_flight_queries_per_token = cli.max_in_flight_queries_per_token;
    config.session_max_duration = cli.session_max_duration_ms.map(Duration::from_millis);
    config.tool_call_timeout = Duration::from_millis(cli.tool_call_timeout_ms);
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(&cli.log_level, cli.json_logs);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cli.port,
        agent_url = ?cli.agent_url,
        "Starting browser bridge"
    );

    let bridge = Bridge::new(build_config(&cli))?;
    server::run_http(bridge, &cli.host, cli.port).await
}
