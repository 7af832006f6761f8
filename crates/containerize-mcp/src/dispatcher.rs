//! Tool dispatcher (C8): shared server state, the `McpTool` trait, and the
//! name→implementation table `tools/list`/`tools/call` drive.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use containerize_monitor::ResourceMonitor;
use containerize_session::SessionManager;
use containerize_workflow::WorkflowExecutor;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::protocol::{CallToolResult, JsonRpcNotification, Tool};

/// Shared across every tool invocation and every transport connection.
pub struct AppState {
    pub session_manager: Arc<SessionManager>,
    pub resource_monitor: Arc<ResourceMonitor>,
    pub workflow_executor: Arc<WorkflowExecutor>,
    pub started_at: DateTime<Utc>,
    /// Progress notifications fan out here; transports subscribe a receiver
    /// for the lifetime of a `tools/call` and forward what they see (stdio:
    /// interleaved lines before the final response; HTTP: the SSE stream).
    pub progress_tx: broadcast::Sender<JsonRpcNotification>,
}

impl AppState {
    pub fn new(session_manager: Arc<SessionManager>, resource_monitor: Arc<ResourceMonitor>, workflow_executor: Arc<WorkflowExecutor>) -> Self {
        let (progress_tx, _rx) = broadcast::channel(256);
        AppState {
            session_manager,
            resource_monitor,
            workflow_executor,
            started_at: Utc::now(),
            progress_tx,
        }
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// An MCP tool: a definition for `tools/list` and a handler for `tools/call`.
#[async_trait::async_trait]
pub trait McpTool: Send + Sync {
    fn definition(&self) -> Tool;
    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult;
}

pub fn get_all_tools() -> Vec<Tool> {
    vec![
        crate::tools::system::PingTool.definition(),
        crate::tools::system::ServerStatusTool.definition(),
        crate::tools::containerize::AnalyzeRepositoryTool.definition(),
        crate::tools::containerize::ContainerizeAndDeployTool.definition(),
        crate::tools::session::ListSessionsTool.definition(),
        crate::tools::session::DeleteSessionTool.definition(),
        crate::tools::session::AddSessionLabelTool.definition(),
        crate::tools::session::RemoveSessionLabelTool.definition(),
    ]
}

pub async fn execute_tool(state: &AppState, name: &str, arguments: Option<Value>) -> CallToolResult {
    match name {
        "ping" => crate::tools::system::PingTool.execute(state, arguments).await,
        "server_status" => crate::tools::system::ServerStatusTool.execute(state, arguments).await,
        "analyze_repository" => crate::tools::containerize::AnalyzeRepositoryTool.execute(state, arguments).await,
        "containerize_and_deploy" => crate::tools::containerize::ContainerizeAndDeployTool.execute(state, arguments).await,
        "list_sessions" => crate::tools::session::ListSessionsTool.execute(state, arguments).await,
        "delete_session" => crate::tools::session::DeleteSessionTool.execute(state, arguments).await,
        "add_session_label" => crate::tools::session::AddSessionLabelTool.execute(state, arguments).await,
        "remove_session_label" => crate::tools::session::RemoveSessionLabelTool.execute(state, arguments).await,
        _ => CallToolResult::error(format!("Unknown tool: {name}")),
    }
}
