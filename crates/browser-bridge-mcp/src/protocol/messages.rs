//! Frontend WebSocket message schema.
//!
//! Every frame is a JSON object with a `type` discriminator. Payloads carried
//! for tools and queries are arbitrary JSON; they are validated only against
//! declared JSON Schemas, never statically typed.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// A tool advertised by a frontend session.
///
/// Schemas are JSON Schema objects conveyed verbatim. An absent schema is a
/// distinct value: `None` does not equal `Some(json!({}))`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolDefinition {
    /// Create a definition with no schemas.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: None,
            output_schema: None,
        }
    }

    /// Structural schema agreement with another definition of the same name.
    ///
    /// `serde_json::Value` maps compare order-independently, which is exactly
    /// deep equality after key-sorting.
    #[must_use]
    pub fn schema_eq(&self, other: &Self) -> bool {
        self.input_schema == other.input_schema && self.output_schema == other.output_schema
    }
}

/// Messages a frontend sends to the bridge.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Claim the connection's session id with credentials.
    #[serde(rename = "authenticate", rename_all = "camelCase")]
    Authenticate {
        #[serde(default)]
        auth_token: Option<String>,
        #[serde(default)]
        session_name: Option<String>,
        #[serde(default)]
        origin: Option<String>,
        #[serde(default)]
        page_title: Option<String>,
        #[serde(default)]
        user_agent: Option<String>,
        /// Client clock, epoch milliseconds. Advisory only.
        #[serde(default)]
        timestamp: Option<f64>,
    },

    /// Add a tool to the session's catalog.
    #[serde(rename = "register-tool")]
    RegisterTool { tool: ToolDefinition },

    /// Liveness ping; refreshes the activity timestamp.
    #[serde(rename = "activity")]
    Activity {
        #[serde(default)]
        timestamp: Option<f64>,
    },

    /// Answer to a forwarded `tool-call`.
    #[serde(rename = "tool-response", rename_all = "camelCase")]
    ToolResponse { request_id: String, result: Value },

    /// Start an agent query.
    #[serde(rename = "query", rename_all = "camelCase")]
    Query {
        uuid: String,
        prompt: String,
        #[serde(default)]
        context: Option<Value>,
        #[serde(default)]
        response_tool: Option<String>,
        #[serde(default)]
        tools: Option<Vec<String>>,
        #[serde(default)]
        restrict_tools: Option<bool>,
        /// Overall deadline in milliseconds.
        #[serde(default)]
        timeout: Option<u64>,
    },

    /// Cancel a previously started query.
    #[serde(rename = "query_cancel")]
    QueryCancel {
        uuid: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl ClientMessage {
    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Messages the bridge sends to a frontend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "authenticated")]
    Authenticated { success: bool },

    #[serde(rename = "authentication-failed")]
    AuthenticationFailed { code: ErrorCode, error: String },

    #[serde(rename = "tool-call", rename_all = "camelCase")]
    ToolCall {
        request_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_input: Option<Value>,
    },

    #[serde(rename = "registration-error", rename_all = "camelCase")]
    RegistrationError { tool_name: String, code: ErrorCode, message: String },

    #[serde(rename = "query_accepted")]
    QueryAccepted { uuid: String },

    #[serde(rename = "query_progress")]
    QueryProgress { uuid: String, message: Value },

    #[serde(rename = "query_complete", rename_all = "camelCase")]
    QueryComplete {
        uuid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<Value>,
        tool_calls: Vec<Value>,
    },

    #[serde(rename = "query_failure")]
    QueryFailure { uuid: String, error: String },

    #[serde(rename = "query_cancel")]
    QueryCancel {
        uuid: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ServerMessage {
    /// Successful authentication acknowledgement.
    #[must_use]
    pub const fn authenticated() -> Self {
        Self::Authenticated { success: true }
    }

    /// Authentication failure with the code's standard message.
    #[must_use]
    pub fn auth_failed(code: ErrorCode, error: impl Into<String>) -> Self {
        Self::AuthenticationFailed { code, error: error.into() }
    }

    /// Serialize to one text frame.
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            // Serialize of these types cannot fail; keep the socket alive anyway.
            r#"{"type":"error"}"#.to_string()
        })
    }
}
