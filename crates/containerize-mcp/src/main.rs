//! containerize-assist-mcp — MCP server for the containerize-and-deploy
//! engine.
//!
//! # Usage
//!
//! ```bash
//! # stdio transport (default)
//! containerize-mcp
//!
//! # HTTP transport
//! containerize-mcp --transport http --host 0.0.0.0 --port 8080
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use containerize_core::{Classifier, FixRegistry, RetryCoordinator};
use containerize_mcp::dispatcher::AppState;
use containerize_mcp::server;
use containerize_monitor::{silent_alert_callback, MonitorConfig, ResourceMonitor};
use containerize_session::{MemoryStore, SessionManager, SessionManagerConfig, SessionStore, SqliteStore};
use containerize_workflow::{
    DefaultAnalyzerAdapter, DefaultBuildAdapter, DefaultClusterAdapter, DefaultDockerfileSynthesizer,
    DefaultKubectlAdapter, DefaultManifestSynthesizer, DefaultScannerAdapter, DefaultServiceEndpointAdapter,
    WorkflowExecutor,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum Transport {
    Stdio,
    Http,
}

/// containerize-assist-mcp server configuration (spec §6's configuration
/// object: workspace dir, TTL, max sessions, quotas, transport, HTTP bind,
/// cleanup/monitoring intervals). Parsed the way `kftray-mcp::main::Args`
/// parses its own CLI surface.
#[derive(Parser, Debug)]
#[command(
    name = "containerize-mcp",
    version,
    about = "MCP server driving the containerize-and-deploy engine",
    long_about = "A Model Context Protocol (MCP) server exposing a containerize-and-deploy \
                  pipeline to LLM clients: repository analysis, Dockerfile synthesis, image \
                  build, Kubernetes deployment, health probing, and vulnerability scanning."
)]
struct Args {
    /// Transport to serve on.
    #[arg(long, value_enum, default_value = "stdio")]
    transport: Transport,

    /// Host address to bind to (HTTP transport only).
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on (HTTP transport only).
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Base directory under which per-session workspaces are created.
    #[arg(long, default_value = "/tmp/containerize-assist/sessions")]
    workspace_base: PathBuf,

    /// Path to the sqlite session store file. Omit for an in-memory store
    /// (state is lost on restart).
    #[arg(long)]
    store_path: Option<PathBuf>,

    /// Maximum concurrent sessions.
    #[arg(long, default_value_t = 100)]
    max_sessions: usize,

    /// Session time-to-live, in hours.
    #[arg(long, default_value_t = 24)]
    session_ttl_hours: i64,

    /// Per-session disk quota, in megabytes.
    #[arg(long, default_value_t = 1024)]
    max_disk_usage_mb: u64,

    /// Total disk quota across all sessions, in megabytes.
    #[arg(long, default_value_t = 20 * 1024)]
    total_disk_limit_mb: u64,

    /// Session garbage-collection interval, in seconds.
    #[arg(long, default_value_t = 3600)]
    cleanup_interval_secs: u64,

    /// Graceful shutdown budget, in seconds (spec §6).
    #[arg(long, default_value_t = 10)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal initialization error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    info!(server = containerize_mcp::protocol::SERVER_NAME, version = containerize_mcp::protocol::SERVER_VERSION, "starting");

    let store: Arc<dyn SessionStore> = match &args.store_path {
        Some(path) => Arc::new(SqliteStore::open(path).await?),
        None => Arc::new(MemoryStore::new()),
    };

    let session_config = SessionManagerConfig {
        workspace_base: args.workspace_base.clone(),
        max_sessions: args.max_sessions,
        ttl: chrono::Duration::hours(args.session_ttl_hours),
        max_disk_usage_per_session: args.max_disk_usage_mb * 1024 * 1024,
        total_disk_limit: args.total_disk_limit_mb * 1024 * 1024,
        cleanup_interval: Duration::from_secs(args.cleanup_interval_secs),
    };

    let session_manager = Arc::new(SessionManager::new(session_config, store));
    let restored = session_manager.hydrate().await?;
    info!(restored, "sessions hydrated from store");
    session_manager.start_cleanup();

    let resource_monitor = ResourceMonitor::new(MonitorConfig::default(), Arc::clone(&session_manager), silent_alert_callback());
    resource_monitor.start();

    let classifier = Arc::new(Classifier::new());
    let fixes = Arc::new(FixRegistry::new());
    let coordinator = Arc::new(RetryCoordinator::new(classifier, fixes));

    let workflow_executor = Arc::new(WorkflowExecutor::new(
        coordinator,
        Arc::clone(&session_manager),
        Arc::new(DefaultAnalyzerAdapter),
        Arc::new(DefaultDockerfileSynthesizer),
        Arc::new(DefaultBuildAdapter),
        Arc::new(DefaultClusterAdapter),
        Arc::new(DefaultManifestSynthesizer::default()),
        Arc::new(DefaultKubectlAdapter),
        Arc::new(DefaultServiceEndpointAdapter),
        Arc::new(DefaultScannerAdapter),
    ));

    let app = Arc::new(AppState::new(Arc::clone(&session_manager), Arc::clone(&resource_monitor), workflow_executor));

    info!("available tools:");
    for tool in containerize_mcp::dispatcher::get_all_tools() {
        info!("  - {}: {}", tool.name, tool.description.unwrap_or_default());
    }

    let serve_result = match args.transport {
        Transport::Stdio => tokio::select! {
            result = server::run_stdio(Arc::clone(&app)) => result,
            () = wait_for_shutdown_signal() => Ok(()),
        },
        Transport::Http => {
            let addr = SocketAddr::new(args.host, args.port);
            tokio::select! {
                result = server::run_http(addr, Arc::clone(&app)) => result,
                () = wait_for_shutdown_signal() => Ok(()),
            }
        }
    };

    info!(budget_secs = args.shutdown_timeout_secs, "shutting down gracefully");
    let shutdown = async {
        resource_monitor.stop().await;
        session_manager.stop().await
    };
    match tokio::time::timeout(Duration::from_secs(args.shutdown_timeout_secs), shutdown).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "error during shutdown"),
        Err(_) => error!("shutdown budget exceeded, exiting anyway"),
    }

    serve_result
}

async fn wait_for_shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");
}
