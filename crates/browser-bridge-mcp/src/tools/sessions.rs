//! Fleet inspection tool.

use serde_json::{Value, json};

use super::{BridgeTool, ToolContext};

/// `list_sessions` - summarize the caller's token fleet.
pub struct ListSessionsTool;

#[async_trait::async_trait]
impl BridgeTool for ListSessionsTool {
    fn name(&self) -> &'static str {
        "list_sessions"
    }

    fn description(&self) -> &'static str {
        "List the connected browser sessions for your token, including each \
         session's id, name, origin, and the tools it exposes. Use the ids to \
         target a specific session in other tool calls."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": [],
        })
    }

    async fn execute(&self, ctx: &ToolContext, _input: Value) -> Result<Value, String> {
        let sessions = ctx.registry.sessions_for_token(&ctx.auth_token).await;

        let entries: Vec<Value> = sessions
            .iter()
            .map(|session| {
                let mut entry = json!({
                    "session_id": session.id,
                    "origin": session.origin,
                    "connected_at": session.connected_at_utc.to_rfc3339(),
                    "last_activity": session.last_activity_utc().to_rfc3339(),
                    "available_tools": session
                        .tools_snapshot()
                        .iter()
                        .map(|t| t.name.clone())
                        .collect::<Vec<_>>(),
                });
                if let Some(name) = &session.name {
                    entry["session_name"] = json!(name);
                }
                if let Some(title) = &session.page_title {
                    entry["page_title"] = json!(title);
                }
                entry
            })
            .collect();

        Ok(json!({ "sessions": entries }))
    }
}
