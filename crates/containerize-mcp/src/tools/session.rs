//! Session management tools (spec §6): `list_sessions`, `delete_session`,
//! and label CRUD.

use containerize_session::SessionFilter;
use serde::Deserialize;
use serde_json::Value;

use crate::dispatcher::{AppState, McpTool};
use crate::protocol::{CallToolResult, Tool};

pub struct ListSessionsTool;

#[derive(Debug, Deserialize, Default)]
struct ListSessionsArgs {
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    any_label: Vec<String>,
}

#[async_trait::async_trait]
impl McpTool for ListSessionsTool {
    fn definition(&self) -> Tool {
        Tool::with_schema(
            "list_sessions",
            "List session summaries, optionally filtered by label.",
            serde_json::json!({
                "labels": { "type": "array", "items": { "type": "string" }, "description": "Labels that must all be present (all-of)" },
                "any_label": { "type": "array", "items": { "type": "string" }, "description": "Labels of which any one match suffices (any-of)" },
            }),
            None,
        )
    }

    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult {
        let args: ListSessionsArgs = match arguments.map(serde_json::from_value).transpose() {
            Ok(args) => args.unwrap_or_default(),
            Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
        };

        let filter = SessionFilter {
            labels: args.labels,
            any_label: args.any_label,
            ..SessionFilter::default()
        };

        let summaries = state.session_manager.list_summaries(&filter);
        CallToolResult::json(&serde_json::json!({ "sessions": summaries, "count": summaries.len() }))
            .unwrap_or_else(|e| CallToolResult::error(e.to_string()))
    }
}

pub struct DeleteSessionTool;

#[derive(Debug, Deserialize)]
struct DeleteSessionArgs {
    session_id: String,
}

#[async_trait::async_trait]
impl McpTool for DeleteSessionTool {
    fn definition(&self) -> Tool {
        Tool::with_schema(
            "delete_session",
            "Delete a session: removes its workspace directory, in-memory state, and store entry.",
            serde_json::json!({ "session_id": { "type": "string" } }),
            Some(vec!["session_id".to_string()]),
        )
    }

    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult {
        let args: DeleteSessionArgs = match arguments.map(serde_json::from_value).transpose() {
            Ok(Some(args)) => args,
            Ok(None) => return CallToolResult::error("missing arguments: session_id is required"),
            Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
        };

        match state.session_manager.delete(&args.session_id).await {
            Ok(()) => CallToolResult::json(&serde_json::json!({ "deleted": true, "session_id": args.session_id })).unwrap(),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }
}

pub struct AddSessionLabelTool;

#[derive(Debug, Deserialize)]
struct LabelArgs {
    session_id: String,
    label: String,
}

#[async_trait::async_trait]
impl McpTool for AddSessionLabelTool {
    fn definition(&self) -> Tool {
        Tool::with_schema(
            "add_session_label",
            "Attach a label to a session.",
            serde_json::json!({ "session_id": { "type": "string" }, "label": { "type": "string" } }),
            Some(vec!["session_id".to_string(), "label".to_string()]),
        )
    }

    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult {
        let args: LabelArgs = match arguments.map(serde_json::from_value).transpose() {
            Ok(Some(args)) => args,
            Ok(None) => return CallToolResult::error("missing arguments: session_id and label are required"),
            Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
        };

        match state.session_manager.add_label(&args.session_id, &args.label).await {
            Ok(session) => CallToolResult::json(&serde_json::json!({ "session_id": session.session_id, "labels": session.labels }))
                .unwrap_or_else(|e| CallToolResult::error(e.to_string())),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }
}

pub struct RemoveSessionLabelTool;

#[async_trait::async_trait]
impl McpTool for RemoveSessionLabelTool {
    fn definition(&self) -> Tool {
        Tool::with_schema(
            "remove_session_label",
            "Remove a label from a session.",
            serde_json::json!({ "session_id": { "type": "string" }, "label": { "type": "string" } }),
            Some(vec!["session_id".to_string(), "label".to_string()]),
        )
    }

    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult {
        let args: LabelArgs = match arguments.map(serde_json::from_value).transpose() {
            Ok(Some(args)) => args,
            Ok(None) => return CallToolResult::error("missing arguments: session_id and label are required"),
            Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
        };

        match state.session_manager.remove_label(&args.session_id, &args.label).await {
            Ok(session) => CallToolResult::json(&serde_json::json!({ "session_id": session.session_id, "labels": session.labels }))
                .unwrap_or_else(|e| CallToolResult::error(e.to_string())),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }
}
