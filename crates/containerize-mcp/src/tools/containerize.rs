//! The core pipeline tools: `analyze_repository` and `containerize_and_deploy`.

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{AppState, McpTool};
use crate::protocol::{CallToolResult, JsonRpcNotification, ProgressParams, Tool};

pub struct AnalyzeRepositoryTool;

#[derive(Debug, Deserialize)]
struct AnalyzeRepositoryArgs {
    repo_url: String,
    branch: Option<String>,
}

#[async_trait::async_trait]
impl McpTool for AnalyzeRepositoryTool {
    fn definition(&self) -> Tool {
        Tool::with_schema(
            "analyze_repository",
            "Detect the language, framework, and listening port of a repository without running the full containerize-and-deploy pipeline.",
            serde_json::json!({
                "repo_url": { "type": "string", "description": "Git URL of the repository to analyze" },
                "branch": { "type": "string", "description": "Branch to analyze; defaults to the repository's default branch" },
            }),
            Some(vec!["repo_url".to_string()]),
        )
    }

    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult {
        let args: AnalyzeRepositoryArgs = match arguments.map(serde_json::from_value).transpose() {
            Ok(Some(args)) => args,
            Ok(None) => return CallToolResult::error("missing arguments: repo_url is required"),
            Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
        };

        let cancel = CancellationToken::new();
        match state
            .workflow_executor
            .analyze_repository(&args.repo_url, args.branch.as_deref(), &cancel)
            .await
        {
            Ok(result) => CallToolResult::json(&serde_json::json!({
                "language": result.language,
                "framework": result.framework,
                "port": result.port,
            }))
            .unwrap_or_else(|e| CallToolResult::error(e.to_string())),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }
}

pub struct ContainerizeAndDeployTool;

#[derive(Debug, Deserialize)]
struct ContainerizeAndDeployArgs {
    session_id: Option<String>,
    repo_url: String,
    branch: Option<String>,
    #[serde(default)]
    scan: bool,
}

#[async_trait::async_trait]
impl McpTool for ContainerizeAndDeployTool {
    fn definition(&self) -> Tool {
        Tool::with_schema(
            "containerize_and_deploy",
            "Run the fixed ten-step pipeline: analyze the repository, synthesize a Dockerfile, build and load the image, generate and apply Kubernetes manifests, probe health, and scan for vulnerabilities.",
            serde_json::json!({
                "session_id": { "type": "string", "description": "Existing session id; omit or pass empty to mint a new session" },
                "repo_url": { "type": "string", "description": "Git URL of the repository to containerize" },
                "branch": { "type": "string", "description": "Branch to build; defaults to the repository's default branch" },
                "scan": { "type": "boolean", "description": "Whether to run the vulnerability scan step" },
            }),
            Some(vec!["repo_url".to_string()]),
        )
    }

    async fn execute(&self, state: &AppState, arguments: Option<Value>) -> CallToolResult {
        let args: ContainerizeAndDeployArgs = match arguments.map(serde_json::from_value).transpose() {
            Ok(Some(args)) => args,
            Ok(None) => return CallToolResult::error("missing arguments: repo_url is required"),
            Err(e) => return CallToolResult::error(format!("invalid arguments: {e}")),
        };

        let requested_id = args.session_id.unwrap_or_default();
        let session = match state.session_manager.get_or_create(&requested_id).await {
            Ok(session) => session,
            Err(e) => return CallToolResult::error(format!("session manager: {e}")),
        };

        let cancel = CancellationToken::new();
        let progress_tx = state.progress_tx.clone();
        let progress_token = session.session_id.clone();
        let on_progress: containerize_workflow::ProgressSink = {
            let progress_token = progress_token.clone();
            std::sync::Arc::new(move |step: &containerize_workflow::WorkflowStep| {
                let progress: f64 = step.progress.split('/').next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                let notification = JsonRpcNotification::progress(ProgressParams {
                    progress_token: progress_token.clone(),
                    progress,
                    total: Some(10.0),
                    message: Some(step.message.clone()),
                });
                let _ = progress_tx.send(notification);
            })
        };

        let result = state
            .workflow_executor
            .containerize_and_deploy(&session.session_id, &args.repo_url, args.branch.as_deref(), args.scan, &cancel, &on_progress)
            .await;

        match result {
            Ok(result) => CallToolResult::json(&result).unwrap_or_else(|e| CallToolResult::error(e.to_string())),
            Err(e) => CallToolResult::error(e.to_string()),
        }
    }
}
