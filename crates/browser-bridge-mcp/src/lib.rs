//! Browser Bridge MCP Server
//!
//! A bridge that lets headless MCP clients invoke tools living inside
//! end-user browser tabs. Browser pages connect outward over WebSocket,
//! register tool catalogs, and service forwarded tool calls; MCP clients
//! speak JSON-RPC 2.0 over HTTP with an SSE side-channel for
//! `tools/list_changed` notifications. Many frontends and many MCP clients
//! multiplex through one bridge, grouped by a shared auth token.
//!
//! # Features
//!
//! - **Session fleet**: per-token quotas, unique session names, periodic
//!   sweep of over-age sessions
//! - **Tool-call correlation**: MCP `tools/call` forwarded to the owning tab
//!   and matched back by request id, with deadlines
//! - **Agent queries**: frontend-originated LLM queries proxied to an agent
//!   endpoint with streamed progress and cancellation
//! - **Runtime-agnostic core**: all I/O behind a transport abstraction; an
//!   axum adapter is included
//!
//! # Example
//!
//! ```no_run
//! use browser_bridge_mcp::{Bridge, BridgeConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BridgeConfig::default().with_agent_url("http://localhost:8801");
//!     let bridge = Bridge::new(config)?;
//!
//!     browser_bridge_mcp::server::run_http(bridge, "127.0.0.1", 8800).await
//! }
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod tools;
pub mod transport;

pub use bridge::Bridge;
pub use config::{BridgeConfig, SessionLimitPolicy};
pub use error::{BridgeError, CallError, ErrorCode};
