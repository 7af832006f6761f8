//! Liveness and introspection tools: `ping`, `server_status`.

use serde::Serialize;
use serde_json::Value;

use crate::dispatcher::{AppState, McpTool};
use crate::protocol::{CallToolResult, Tool};

pub struct PingTool;

#[async_trait::async_trait]
impl McpTool for PingTool {
    fn definition(&self) -> Tool {
        Tool::new("ping", "Liveness check. Always returns immediately with `pong`.")
    }

    async fn execute(&self, _state: &AppState, _arguments: Option<Value>) -> CallToolResult {
        CallToolResult::json(&serde_json::json!({ "status": "pong" })).unwrap_or_else(|e| CallToolResult::error(e.to_string()))
    }
}

pub struct ServerStatusTool;

/// The `server_status` body this crate supplements (spec.md §6 names the
/// tool but leaves it undetailed; SPEC_FULL §1.2 fills it in): process
/// uptime, session counts, and the resource monitor's current pressure and
/// health status.
#[derive(Debug, Serialize)]
struct ServerStatusResponse {
    server: &'static str,
    version: &'static str,
    protocol_version: &'static str,
    uptime_seconds: i64,
    session_count: usize,
    max_sessions: usize,
    total_disk_usage_bytes: u64,
    total_disk_limit_bytes: u64,
    resource_usage: containerize_monitor::CurrentResourceUsage,
    active_alert_count: usize,
}

#[async_trait::async_trait]
impl McpTool for ServerStatusTool {
    fn definition(&self) -> Tool {
        Tool::new(
            "server_status",
            "Report server uptime, active session counts, disk usage, and the resource monitor's current pressure and health status.",
        )
    }

    async fn execute(&self, state: &AppState, _arguments: Option<Value>) -> CallToolResult {
        let response = ServerStatusResponse {
            server: crate::protocol::SERVER_NAME,
            version: crate::protocol::SERVER_VERSION,
            protocol_version: crate::protocol::MCP_PROTOCOL_VERSION,
            uptime_seconds: state.uptime_seconds(),
            session_count: state.session_manager.session_count(),
            max_sessions: state.session_manager.max_sessions(),
            total_disk_usage_bytes: state.session_manager.total_disk_usage(),
            total_disk_limit_bytes: state.session_manager.total_disk_limit(),
            resource_usage: state.resource_monitor.current_usage(),
            active_alert_count: state.resource_monitor.active_alerts().len(),
        };

        CallToolResult::json(&response).unwrap_or_else(|e| CallToolResult::error(e.to_string()))
    }
}
