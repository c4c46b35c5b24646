//! Error types for the bridge.
//!
//! Uses `thiserror` for structured error handling with automatic `From`
//! implementations. Two classes exist on the wire: fatal errors surface as
//! JSON-RPC error objects or WebSocket closes, recoverable errors surface as
//! MCP soft results with `isError: true` and contextual fields.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Wire-visible error codes.
///
/// Fatal codes appear as JSON-RPC `error.message`; recoverable codes appear
/// in the `error` field of a soft result payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    MissingAuthentication,
    InvalidAuthentication,
    SessionIdInUse,
    SessionNameAlreadyInUse,
    SessionLimitExceeded,
    SessionNotFound,
    SessionNotSpecified,
    ToolNotFound,
    ToolSchemaConflict,
    ToolCallTimeout,
    QueryLimitExceeded,
    QueryNotFound,
    QueryNotActive,
    UnknownMethod,
    InternalError,
    BridgeShutdown,
}

impl ErrorCode {
    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingAuthentication => "MissingAuthentication",
            Self::InvalidAuthentication => "InvalidAuthentication",
            Self::SessionIdInUse => "SessionIdInUse",
            Self::SessionNameAlreadyInUse => "SessionNameAlreadyInUse",
            Self::SessionLimitExceeded => "SessionLimitExceeded",
            Self::SessionNotFound => "SessionNotFound",
            Self::SessionNotSpecified => "SessionNotSpecified",
            Self::ToolNotFound => "ToolNotFound",
            Self::ToolSchemaConflict => "ToolSchemaConflict",
            Self::ToolCallTimeout => "ToolCallTimeout",
            Self::QueryLimitExceeded => "QueryLimitExceeded",
            Self::QueryNotFound => "QueryNotFound",
            Self::QueryNotActive => "QueryNotActive",
            Self::UnknownMethod => "UnknownMethod",
            Self::InternalError => "InternalError",
            Self::BridgeShutdown => "BridgeShutdown",
        }
    }

    /// Returns true if this code must be surfaced as a JSON-RPC error rather
    /// than a soft result.
    #[must_use]
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::MissingAuthentication
                | Self::InvalidAuthentication
                | Self::UnknownMethod
                | Self::InternalError
                | Self::BridgeShutdown
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from bridge-level operations (protocol and lifecycle).
#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    /// Request carried no usable auth token
    #[error("MissingAuthentication")]
    MissingAuthentication,

    /// JSON-RPC method is not part of the surface
    #[error("UnknownMethod: {method}")]
    UnknownMethod {
        /// The unrecognized method name
        method: String,
    },

    /// Request body was not valid JSON-RPC
    #[error("Malformed request: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Bridge is shutting down
    #[error("BridgeShutdown")]
    Shutdown,

    /// Anything unexpected inside a handler
    #[error("InternalError: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create an unknown-method error.
    #[must_use]
    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod { method: method.into() }
    }

    /// The wire code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingAuthentication => ErrorCode::MissingAuthentication,
            Self::UnknownMethod { .. } => ErrorCode::UnknownMethod,
            Self::Malformed(_) | Self::Internal(_) => ErrorCode::InternalError,
            Self::Shutdown => ErrorCode::BridgeShutdown,
        }
    }

    /// JSON-RPC numeric code.
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::MissingAuthentication => -32600,
            Self::UnknownMethod { .. } => -32601,
            Self::Malformed(_) => -32700,
            Self::Shutdown | Self::Internal(_) => -32603,
        }
    }
}

/// Outcomes of a correlated tool call that did not produce a result.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The frontend did not respond before the deadline
    #[error("Tool call timed out after {0:?}")]
    Timeout(Duration),

    /// The owning session closed while the call was pending
    #[error("Session closed")]
    SessionClosed,

    /// The bridge is shutting down
    #[error("Bridge shutting down")]
    Shutdown,

    /// The socket was not writable when the call was dispatched
    #[error("Session socket not open")]
    SocketNotOpen,
}

impl CallError {
    /// The wire code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::ToolCallTimeout,
            Self::SessionClosed | Self::SocketNotOpen => ErrorCode::SessionNotFound,
            Self::Shutdown => ErrorCode::BridgeShutdown,
        }
    }

    /// Returns true if the caller may retry against a fresh listing.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Shutdown)
    }
}

/// Errors from the agent HTTP upstream used by the query pipeline.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// No `agentUrl` is configured
    #[error("No agent endpoint configured")]
    NotConfigured,

    /// HTTP transport error (connection, DNS, TLS, etc.)
    #[error("Agent request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Middleware error
    #[error("Agent request failed: {0}")]
    Middleware(#[from] reqwest_middleware::Error),

    /// Agent answered with a non-success status
    #[error("Agent returned status {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body or message
        message: String,
    },

    /// Agent stream carried an unparseable event
    #[error("Failed to parse agent event: {0}")]
    Parse(#[from] serde_json::Error),

    /// Query exceeded its overall deadline
    #[error("Query timed out after {0:?}")]
    Timeout(Duration),

    /// Query was cancelled before completion
    #[error("Query cancelled")]
    Cancelled,
}

impl AgentError {
    /// Create a status error.
    #[must_use]
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status { status, message: message.into() }
    }

    /// Convert to the message reported in `query_failure`.
    #[must_use]
    pub fn to_failure_message(&self) -> String {
        match self {
            Self::NotConfigured => "No agent endpoint configured".to_string(),
            Self::Timeout(_) => "Query timed out".to_string(),
            _ => self.to_string(),
        }
    }
}

/// Result type alias for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Result type alias for correlated tool calls.
pub type CallResult<T> = Result<T, CallError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_form() {
        assert_eq!(ErrorCode::SessionNameAlreadyInUse.as_str(), "SessionNameAlreadyInUse");
        assert_eq!(ErrorCode::ToolCallTimeout.to_string(), "ToolCallTimeout");
        assert_eq!(
            serde_json::to_value(ErrorCode::SessionNotSpecified).unwrap(),
            serde_json::json!("SessionNotSpecified")
        );
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ErrorCode::MissingAuthentication.is_fatal());
        assert!(ErrorCode::UnknownMethod.is_fatal());
        assert!(!ErrorCode::SessionNotSpecified.is_fatal());
        assert!(!ErrorCode::ToolNotFound.is_fatal());
    }

    #[test]
    fn test_bridge_error_jsonrpc_codes() {
        assert_eq!(BridgeError::MissingAuthentication.jsonrpc_code(), -32600);
        assert_eq!(BridgeError::unknown_method("tools/frobnicate").jsonrpc_code(), -32601);
        assert_eq!(BridgeError::internal("boom").jsonrpc_code(), -32603);
    }

    #[test]
    fn test_call_error_codes() {
        assert_eq!(
            CallError::Timeout(Duration::from_secs(30)).code(),
            ErrorCode::ToolCallTimeout
        );
        assert_eq!(CallError::SessionClosed.code(), ErrorCode::SessionNotFound);
        assert!(CallError::SessionClosed.is_recoverable());
        assert!(!CallError::Shutdown.is_recoverable());
    }

    #[test]
    fn test_agent_error_failure_message() {
        assert_eq!(
            AgentError::Timeout(Duration::from_secs(60)).to_failure_message(),
            "Query timed out"
        );
        assert!(AgentError::status(502, "bad gateway").to_failure_message().contains("502"));
    }
}
