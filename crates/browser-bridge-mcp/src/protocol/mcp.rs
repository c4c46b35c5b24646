//! MCP result payload helpers.
//!
//! Builders for `initialize`/listing results, soft-error results, and the
//! content wrapping applied to tool outputs (JSON-stringified text, with
//! `data:image/*;base64,...` strings promoted to ImageContent blocks).

use base64::Engine as _;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::OnceLock;

use crate::config::{BridgeConfig, defaults};
use crate::error::ErrorCode;
use crate::protocol::messages::ToolDefinition;

/// Server identity for `GET /` liveness probes.
#[must_use]
pub fn server_info(config: &BridgeConfig) -> Value {
    let mut info = json!({
        "name": config.name,
        "description": config.description,
        "version": env!("CARGO_PKG_VERSION"),
    });
    if let Some(icon) = &config.icon {
        info["icon"] = json!(icon);
    }
    info
}

/// The `initialize` result. The client's protocol version is echoed when it
/// sent one.
#[must_use]
pub fn initialize_result(config: &BridgeConfig, params: &Value) -> Value {
    let protocol_version = params
        .get("protocolVersion")
        .and_then(Value::as_str)
        .unwrap_or(defaults::PROTOCOL_VERSION);

    let mut server_info = json!({
        "name": config.name,
        "description": config.description,
    });
    if let Some(icon) = &config.icon {
        server_info["icon"] = json!(icon);
    }

    json!({
        "protocolVersion": protocol_version,
        "capabilities": {
            "tools": { "listChanged": true },
            "resources": {},
            "prompts": {},
        },
        "serverInfo": server_info,
    })
}

/// One entry of a `tools/list` result.
#[must_use]
pub fn tool_entry(tool: &ToolDefinition) -> Value {
    let mut entry = json!({
        "name": tool.name,
        "description": tool.description,
    });
    if let Some(schema) = &tool.input_schema {
        entry["inputSchema"] = schema.clone();
    }
    if let Some(schema) = &tool.output_schema {
        entry["outputSchema"] = schema.clone();
    }
    entry
}

/// Inject the `session_id` disambiguation property into a tool's input
/// schema. Used when more than one frontend session serves the same token.
#[must_use]
pub fn annotate_with_session_id(entry: &Value) -> Value {
    let mut entry = entry.clone();
    let schema = entry
        .get("inputSchema")
        .cloned()
        .unwrap_or_else(|| json!({ "type": "object", "properties": {} }));

    let mut schema = if schema.is_object() { schema } else { json!({ "type": "object" }) };
    if let Some(obj) = schema.as_object_mut() {
        obj.entry("type").or_insert(json!("object"));

        if let Some(props) = obj.entry("properties").or_insert(json!({})).as_object_mut() {
            props.insert(
                "session_id".to_string(),
                json!({
                    "type": "string",
                    "description":
                        "Target session id. Required because multiple sessions expose tools; \
                         see _meta.available_sessions on tools/list.",
                }),
            );
        }

        if let Some(required) = obj.entry("required").or_insert(json!([])).as_array_mut() {
            if !required.iter().any(|v| v == "session_id") {
                required.push(json!("session_id"));
            }
        }
    }

    entry["inputSchema"] = schema;
    entry
}

/// A recoverable ("soft") MCP result.
///
/// The payload fields are carried both at the top level of the result and
/// JSON-stringified inside a text content block, so callers can recover
/// without another round-trip.
#[must_use]
pub fn soft_error(code: ErrorCode, extra: Value) -> Value {
    let mut payload = json!({ "error": code.as_str() });
    if let (Some(payload_obj), Some(extra_obj)) = (payload.as_object_mut(), extra.as_object()) {
        for (k, v) in extra_obj {
            payload_obj.insert(k.clone(), v.clone());
        }
    }

    let mut result = json!({
        "content": [{ "type": "text", "text": payload.to_string() }],
        "isError": true,
    });
    if let (Some(result_obj), Some(payload_obj)) = (result.as_object_mut(), payload.as_object()) {
        for (k, v) in payload_obj {
            result_obj.insert(k.clone(), v.clone());
        }
    }
    result
}

fn image_data_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^data:(image/[\w.+-]+);base64,([A-Za-z0-9+/=\s]+)$")
            .expect("valid data-uri regex")
    })
}

/// Split a `data:image/*;base64,...` string into (mime type, payload) if the
/// payload is well-formed base64.
#[must_use]
pub fn parse_image_data_uri(text: &str) -> Option<(String, String)> {
    let captures = image_data_uri_regex().captures(text)?;
    let mime = captures.get(1)?.as_str().to_string();
    let data: String = captures.get(2)?.as_str().chars().filter(|c| !c.is_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(&data).ok()?;
    Some((mime, data))
}

/// Wrap a frontend tool result as MCP content blocks.
#[must_use]
pub fn wrap_tool_result(result: &Value) -> Value {
    let content = match result {
        Value::String(text) => match parse_image_data_uri(text) {
            Some((mime, data)) => json!([{ "type": "image", "data": data, "mimeType": mime }]),
            None => json!([{ "type": "text", "text": text }]),
        },
        other => json!([{ "type": "text", "text": other.to_string() }]),
    };
    json!({ "content": content, "isError": false })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tool(name: &str, schema: Option<Value>) -> ToolDefinition {
        ToolDefinition { input_schema: schema, ..ToolDefinition::new(name, "a tool") }
    }

    #[test]
    fn test_initialize_result_shape() {
        let result = initialize_result(&BridgeConfig::default(), &json!({}));
        assert_eq!(result["capabilities"]["tools"]["listChanged"], true);
        assert!(result["capabilities"]["resources"].is_object());
        assert_eq!(result["protocolVersion"], defaults::PROTOCOL_VERSION);
        assert!(result["serverInfo"]["name"].is_string());
        assert!(result["serverInfo"].get("icon").is_none());
    }

    #[test]
    fn test_initialize_echoes_client_protocol_version() {
        let params = json!({ "protocolVersion": "2025-03-26" });
        let result = initialize_result(&BridgeConfig::default(), &params);
        assert_eq!(result["protocolVersion"], "2025-03-26");
    }

    #[test]
    fn test_server_info_includes_icon_when_set() {
        let mut config = BridgeConfig::default();
        config.icon = Some("https://example.com/icon.png".to_string());
        let info = server_info(&config);
        assert_eq!(info["icon"], "https://example.com/icon.png");
        assert!(info["version"].is_string());
    }

    #[test]
    fn test_tool_entry_skips_absent_schemas() {
        let entry = tool_entry(&tool("move", None));
        assert_eq!(entry["name"], "move");
        assert!(entry.get("inputSchema").is_none());

        let entry = tool_entry(&tool("move", Some(json!({"type": "object"}))));
        assert_eq!(entry["inputSchema"]["type"], "object");
    }

    #[test]
    fn test_annotate_adds_required_session_id() {
        let entry = tool_entry(&tool(
            "move",
            Some(json!({
                "type": "object",
                "properties": { "to": { "type": "string" } },
                "required": ["to"],
            })),
        ));
        let annotated = annotate_with_session_id(&entry);
        let schema = &annotated["inputSchema"];

        assert_eq!(schema["properties"]["session_id"]["type"], "string");
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("to")));
        assert!(required.contains(&json!("session_id")));
    }

    #[test]
    fn test_annotate_handles_schemaless_tool() {
        let annotated = annotate_with_session_id(&tool_entry(&tool("move", None)));
        let schema = &annotated["inputSchema"];
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["required"], json!(["session_id"]));
    }

    #[test]
    fn test_soft_error_carries_context_twice() {
        let result = soft_error(
            ErrorCode::SessionNotSpecified,
            json!({ "available_sessions": ["a", "b"] }),
        );

        assert_eq!(result["isError"], true);
        assert_eq!(result["error"], "SessionNotSpecified");
        assert_eq!(result["available_sessions"], json!(["a", "b"]));

        let text = result["content"][0]["text"].as_str().unwrap();
        let payload: Value = serde_json::from_str(text).unwrap();
        assert_eq!(payload["error"], "SessionNotSpecified");
        assert_eq!(payload["available_sessions"], json!(["a", "b"]));
    }

    #[test]
    fn test_wrap_object_result_stringifies() {
        let wrapped = wrap_tool_result(&json!({"score": 3}));
        assert_eq!(wrapped["isError"], false);
        assert_eq!(wrapped["content"][0]["type"], "text");
        let text = wrapped["content"][0]["text"].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(text).unwrap(), json!({"score": 3}));
    }

    #[test]
    fn test_wrap_plain_string_result() {
        let wrapped = wrap_tool_result(&json!("done"));
        assert_eq!(wrapped["content"][0]["text"], "done");
    }

    #[test]
    fn test_wrap_image_data_uri() {
        // "hi" in base64
        let uri = "data:image/png;base64,aGk=";
        let wrapped = wrap_tool_result(&json!(uri));
        let block = &wrapped["content"][0];
        assert_eq!(block["type"], "image");
        assert_eq!(block["mimeType"], "image/png");
        assert_eq!(block["data"], "aGk=");
    }

    #[test]
    fn test_malformed_data_uri_falls_back_to_text() {
        let uri = "data:image/png;base64,!!!not-base64!!!";
        let wrapped = wrap_tool_result(&json!(uri));
        assert_eq!(wrapped["content"][0]["type"], "text");
    }
}
