//! Wire protocol types.
//!
//! Two surfaces meet at the bridge: the private frontend WebSocket schema
//! ([`messages`]) and MCP JSON-RPC over HTTP ([`jsonrpc`], [`mcp`]).

pub mod jsonrpc;
pub mod mcp;
pub mod messages;

pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
pub use messages::{ClientMessage, ServerMessage, ToolDefinition};
