//! Built-in bridge tools.
//!
//! A small catalog the bridge itself answers without touching any frontend.
//! Built-ins are listed alongside aggregated frontend tools and short-circuit
//! in `tools/call`.

mod sessions;

pub use sessions::ListSessionsTool;

use std::sync::Arc;

use crate::bridge::session::Registry;

/// Execution context handed to built-in tools.
pub struct ToolContext {
    /// Session registry for fleet lookups.
    pub registry: Arc<Registry>,
    /// Token of the calling MCP session; scopes every lookup.
    pub auth_token: String,
}

impl ToolContext {
    /// Create a context scoped to one token.
    #[must_use]
    pub fn new(registry: Arc<Registry>, auth_token: impl Into<String>) -> Self {
        Self { registry, auth_token: auth_token.into() }
    }
}

/// Trait for built-in tools.
#[async_trait::async_trait]
pub trait BridgeTool: Send + Sync {
    /// Tool name (e.g. "list_sessions").
    fn name(&self) -> &'static str;

    /// Tool description for the MCP client.
    fn description(&self) -> &'static str;

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input.
    async fn execute(
        &self,
        ctx: &ToolContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, String>;
}

/// Register all built-in tools.
#[must_use]
pub fn register_builtin_tools() -> Vec<Box<dyn BridgeTool>> {
    vec![Box::new(sessions::ListSessionsTool)]
}
