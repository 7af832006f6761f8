//! Workflow executor (C7): drives the fixed ten-step `containerize_and_deploy`
//! pipeline (spec §4.7) through the retry-and-fix coordinator (C3), recording
//! a [`WorkflowStep`] per step regardless of outcome so partial progress is
//! always visible (spec property 9 / scenarios S3, S4).

use std::sync::Arc;
use std::time::Duration;

use containerize_core::{RetryCoordinator, RetryPolicy};
use containerize_session::{Session, SessionManager, ToolExecution};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapters::{
    AnalyzerAdapter, BuildAdapter, ClusterAdapter, DockerfileSynthesizer, KubectlAdapter, ManifestSynthesizer,
    ScannerAdapter, ServiceEndpointAdapter,
};
use crate::steps::{WorkflowStep, STEP_MAX_RETRIES, STEP_NAMES};

/// Emitted after every step transition; the MCP layer forwards these as
/// `notifications/progress` (spec §6).
pub type ProgressSink = Arc<dyn Fn(&WorkflowStep) + Send + Sync>;

pub fn silent_progress_sink() -> ProgressSink {
    Arc::new(|_step| {})
}

/// The wire shape of a finished (or partially finished) run (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerizeResult {
    pub success: bool,
    pub endpoint: Option<String>,
    pub image_ref: Option<String>,
    pub k8s_namespace: Option<String>,
    pub scan_report: Option<serde_json::Value>,
    pub steps: Vec<WorkflowStep>,
    pub error: Option<String>,
}

pub struct WorkflowExecutor {
    coordinator: Arc<RetryCoordinator>,
    session_manager: Arc<SessionManager>,
    analyzer: Arc<dyn AnalyzerAdapter>,
    dockerfile_synthesizer: Arc<dyn DockerfileSynthesizer>,
    build_adapter: Arc<dyn BuildAdapter>,
    cluster_adapter: Arc<dyn ClusterAdapter>,
    manifest_synthesizer: Arc<dyn ManifestSynthesizer>,
    kubectl_adapter: Arc<dyn KubectlAdapter>,
    service_endpoint_adapter: Arc<dyn ServiceEndpointAdapter>,
    scanner_adapter: Arc<dyn ScannerAdapter>,
}

/// Per-step timeouts (spec §4.7): build gets the longest window, the health
/// probe the shortest, the scan the most generous of all.
const BUILD_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const SCAN_TIMEOUT: Duration = Duration::from_secs(10 * 60);

impl WorkflowExecutor {
    pub fn new(
        coordinator: Arc<RetryCoordinator>,
        session_manager: Arc<SessionManager>,
        analyzer: Arc<dyn AnalyzerAdapter>,
        dockerfile_synthesizer: Arc<dyn DockerfileSynthesizer>,
        build_adapter: Arc<dyn BuildAdapter>,
        cluster_adapter: Arc<dyn ClusterAdapter>,
        manifest_synthesizer: Arc<dyn ManifestSynthesizer>,
        kubectl_adapter: Arc<dyn KubectlAdapter>,
        service_endpoint_adapter: Arc<dyn ServiceEndpointAdapter>,
        scanner_adapter: Arc<dyn ScannerAdapter>,
    ) -> Self {
        for (i, name) in STEP_NAMES.iter().enumerate() {
            coordinator.set_policy(
                *name,
                RetryPolicy {
                    max_attempts: STEP_MAX_RETRIES[i] + 1,
                    ..RetryPolicy::default()
                },
            );
        }

        WorkflowExecutor {
            coordinator,
            session_manager,
            analyzer,
            dockerfile_synthesizer,
            build_adapter,
            cluster_adapter,
            manifest_synthesizer,
            kubectl_adapter,
            service_endpoint_adapter,
            scanner_adapter,
        }
    }

    /// Runs step 1 alone, outside any session's stage history — backs the
    /// standalone `analyze_repository` tool (spec §6's tool list), which a
    /// caller uses to preview detection before committing to a full run.
    pub async fn analyze_repository(
        &self,
        repo_url: &str,
        branch: Option<&str>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<crate::adapters::AnalyzeResult> {
        let repo_url = repo_url.to_string();
        let branch = branch.map(|b| b.to_string());
        let mut attempts = 0;
        self.coordinator
            .execute_with_fix_tracked(STEP_NAMES[0], cancel, &mut attempts, |_ctx| {
                let analyzer = Arc::clone(&self.analyzer);
                let repo_url = repo_url.clone();
                let branch = branch.clone();
                async move { analyzer.analyze(&repo_url, branch.as_deref()).await }
            })
            .await
    }

    /// Runs all ten steps against `session_id`, recording progress into the
    /// session's `stage_history` as each step finishes. Cancellation stops
    /// the pipeline after the step in flight completes or fails; no new
    /// step starts once `cancel` is set.
    pub async fn containerize_and_deploy(
        &self,
        session_id: &str,
        repo_url: &str,
        branch: Option<&str>,
        scan: bool,
        cancel: &CancellationToken,
        on_progress: &ProgressSink,
    ) -> anyhow::Result<ContainerizeResult> {
        let mut steps: Vec<WorkflowStep> = Vec::with_capacity(10);
        let mut image_ref: Option<String> = None;
        let mut k8s_namespace: Option<String> = None;
        let mut endpoint: Option<String> = None;
        let mut scan_report: Option<serde_json::Value> = None;
        let mut analyze_result = None;
        let mut dockerfile = None;
        let mut manifests: Option<Vec<String>> = None;

        macro_rules! record_step_result {
            ($index:expr, $name:expr, $started:expr, $outcome:expr, $attempts:expr) => {{
                // `$attempts` is the 1-indexed attempt count the coordinator
                // actually made for this call (success or failure); the
                // circuit breaker's `failure_count` is cumulative across
                // calls and gets reset on success, so it can't answer "how
                // many retries did this call take" (spec scenarios S2/S3).
                let retries = $attempts.saturating_sub(1);
                let mut step = match &$outcome {
                    Ok(_) => $started.complete(format!("{} completed", $name)),
                    Err(err) => $started.fail(err.to_string(), retries),
                };
                step.retries = retries;
                self.log_stage(session_id, $name, step.clone()).await;
                on_progress(&step);
                let failed = step.error.is_some();
                steps.push(step);
                failed
            }};
        }

        // step 1: analyze_repository
        let step = WorkflowStep::start(1, STEP_NAMES[0], "analyzing repository");
        let repo_url_owned = repo_url.to_string();
        let branch_owned = branch.map(|b| b.to_string());
        let mut attempts = 0;
        let outcome = self
            .coordinator
            .execute_with_fix_tracked(STEP_NAMES[0], cancel, &mut attempts, |_ctx| {
                let analyzer = Arc::clone(&self.analyzer);
                let repo_url = repo_url_owned.clone();
                let branch = branch_owned.clone();
                async move { analyzer.analyze(&repo_url, branch.as_deref()).await }
            })
            .await;
        let failed = record_step_result!(1, STEP_NAMES[0], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }
        analyze_result = Some(outcome.unwrap());

        // step 2: generate_dockerfile
        let step = WorkflowStep::start(2, STEP_NAMES[1], "synthesizing Dockerfile");
        let analyze_result_ref = analyze_result.clone().expect("step 1 succeeded");
        let mut attempts = 0;
        let outcome = self
            .coordinator
            .execute_with_fix_tracked(STEP_NAMES[1], cancel, &mut attempts, |_ctx| {
                let synthesizer = Arc::clone(&self.dockerfile_synthesizer);
                let analyze_result_ref = analyze_result_ref.clone();
                async move { synthesizer.synthesize(&analyze_result_ref).await }
            })
            .await;
        let failed = record_step_result!(2, STEP_NAMES[1], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }
        dockerfile = Some(outcome.unwrap());
        self.stash_dockerfile(session_id, dockerfile.clone().unwrap()).await;

        // step 3: build_image
        let step = WorkflowStep::start(3, STEP_NAMES[2], "building image");
        let analyzed = analyze_result.clone().expect("step 1 succeeded");
        let dockerfile_ref = dockerfile.clone().expect("step 2 succeeded");
        let image_name = analyzed.framework.clone();
        let mut attempts = 0;
        let outcome = tokio::time::timeout(
            BUILD_TIMEOUT,
            self.coordinator.execute_with_fix_tracked(STEP_NAMES[2], cancel, &mut attempts, |ctx| {
                let build_adapter = Arc::clone(&self.build_adapter);
                let dockerfile_ref = dockerfile_ref.clone();
                let image_name = image_name.clone();
                async move { build_adapter.build(&dockerfile_ref, &image_name, ctx.params).await }
            }),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("build_image timed out after {BUILD_TIMEOUT:?}")));
        let failed = record_step_result!(3, STEP_NAMES[2], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }
        image_ref = Some(outcome.unwrap().image_ref);
        self.stash_image_ref(session_id, image_ref.clone().unwrap()).await;

        // step 4: ensure_cluster — no retry wrapping per spec's table (max 0 retries, run directly)
        let step = WorkflowStep::start(4, STEP_NAMES[3], "ensuring local cluster");
        let outcome = self.cluster_adapter.ensure_cluster().await;
        let retries = 0;
        let recorded_step = match &outcome {
            Ok(_) => step.complete(format!("{} completed", STEP_NAMES[3])),
            Err(err) => step.fail(err.to_string(), retries),
        };
        self.log_stage(session_id, STEP_NAMES[3], recorded_step.clone()).await;
        on_progress(&recorded_step);
        let failed = recorded_step.error.is_some();
        steps.push(recorded_step);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }

        // step 5: load_image
        let step = WorkflowStep::start(5, STEP_NAMES[4], "loading image into cluster");
        let image_ref_val = image_ref.clone().expect("step 3 succeeded");
        let mut attempts = 0;
        let outcome = self
            .coordinator
            .execute_with_fix_tracked(STEP_NAMES[4], cancel, &mut attempts, |_ctx| {
                let cluster_adapter = Arc::clone(&self.cluster_adapter);
                let image_ref_val = image_ref_val.clone();
                async move { cluster_adapter.load_image(&image_ref_val).await }
            })
            .await;
        let failed = record_step_result!(5, STEP_NAMES[4], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }

        // step 6: generate_manifests
        let step = WorkflowStep::start(6, STEP_NAMES[5], "generating manifests");
        let analyzed = analyze_result.clone().expect("step 1 succeeded");
        let image_ref_val = image_ref.clone().expect("step 3 succeeded");
        let mut attempts = 0;
        let outcome = self
            .coordinator
            .execute_with_fix_tracked(STEP_NAMES[5], cancel, &mut attempts, |_ctx| {
                let manifest_synthesizer = Arc::clone(&self.manifest_synthesizer);
                let analyzed = analyzed.clone();
                let image_ref_val = image_ref_val.clone();
                async move { manifest_synthesizer.synthesize(&analyzed, &image_ref_val).await }
            })
            .await;
        let failed = record_step_result!(6, STEP_NAMES[5], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }
        manifests = Some(outcome.unwrap());
        self.stash_manifests(session_id, manifests.clone().unwrap()).await;

        // step 7: apply_manifests
        let step = WorkflowStep::start(7, STEP_NAMES[6], "applying manifests");
        let manifests_ref = manifests.clone().expect("step 6 succeeded");
        let mut attempts = 0;
        let outcome = self
            .coordinator
            .execute_with_fix_tracked(STEP_NAMES[6], cancel, &mut attempts, |_ctx| {
                let kubectl_adapter = Arc::clone(&self.kubectl_adapter);
                let manifests_ref = manifests_ref.clone();
                async move { kubectl_adapter.apply(&manifests_ref).await }
            })
            .await;
        let failed = record_step_result!(7, STEP_NAMES[6], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }
        k8s_namespace = Some(outcome.unwrap());

        // step 8: health_probe
        let step = WorkflowStep::start(8, STEP_NAMES[7], "probing service health");
        let namespace = k8s_namespace.clone().expect("step 7 succeeded");
        let analyzed = analyze_result.clone().expect("step 1 succeeded");
        let mut attempts = 0;
        let outcome = tokio::time::timeout(
            HEALTH_PROBE_TIMEOUT,
            self.coordinator.execute_with_fix_tracked(STEP_NAMES[7], cancel, &mut attempts, |_ctx| {
                let service_endpoint_adapter = Arc::clone(&self.service_endpoint_adapter);
                let namespace = namespace.clone();
                let analyzed = analyzed.clone();
                async move { service_endpoint_adapter.probe(&namespace, &analyzed).await }
            }),
        )
        .await
        .unwrap_or_else(|_| Err(anyhow::anyhow!("health_probe timed out after {HEALTH_PROBE_TIMEOUT:?}")));
        let failed = record_step_result!(8, STEP_NAMES[7], step, outcome, attempts);
        if failed {
            return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
        }
        endpoint = Some(outcome.unwrap());

        // step 9: vulnerability_scan — only invokes the scanner when requested
        // (spec §4.7's table); skipped runs still occupy the step so
        // `steps.length` stays 10 regardless of `scan` (spec scenario S1).
        let step = WorkflowStep::start(9, STEP_NAMES[8], "scanning image for vulnerabilities");
        if scan {
            let image_ref_val = image_ref.clone().expect("step 3 succeeded");
            let mut attempts = 0;
            let outcome = tokio::time::timeout(
                SCAN_TIMEOUT,
                self.coordinator.execute_with_fix_tracked(STEP_NAMES[8], cancel, &mut attempts, |_ctx| {
                    let scanner_adapter = Arc::clone(&self.scanner_adapter);
                    let image_ref_val = image_ref_val.clone();
                    async move { scanner_adapter.scan(&image_ref_val).await }
                }),
            )
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("vulnerability_scan timed out after {SCAN_TIMEOUT:?}")));
            let failed = record_step_result!(9, STEP_NAMES[8], step, outcome, attempts);
            if failed {
                return Ok(self.failure_result(steps, image_ref, k8s_namespace, endpoint, scan_report));
            }
            scan_report = Some(outcome.unwrap());
            self.stash_scan_summary(session_id, scan_report.clone().unwrap()).await;
        } else {
            let skipped = step.complete("vulnerability_scan skipped (scan not requested)");
            self.log_stage(session_id, STEP_NAMES[8], skipped.clone()).await;
            on_progress(&skipped);
            steps.push(skipped);
        }

        // step 10: finalize — pure bookkeeping, no external call, no retry policy.
        let step = WorkflowStep::start(10, STEP_NAMES[9], "finalizing");
        let finalized = step.complete("containerize_and_deploy completed");
        self.log_stage(session_id, STEP_NAMES[9], finalized.clone()).await;
        on_progress(&finalized);
        steps.push(finalized);

        info!(session_id, image_ref = image_ref.as_deref(), "containerize_and_deploy succeeded");

        Ok(ContainerizeResult {
            success: true,
            endpoint,
            image_ref,
            k8s_namespace,
            scan_report,
            steps,
            error: None,
        })
    }

    fn failure_result(
        &self,
        steps: Vec<WorkflowStep>,
        image_ref: Option<String>,
        k8s_namespace: Option<String>,
        endpoint: Option<String>,
        scan_report: Option<serde_json::Value>,
    ) -> ContainerizeResult {
        let error = steps.last().and_then(|s| s.error.clone());
        warn!(step_count = steps.len(), "containerize_and_deploy stopped short of completion");
        ContainerizeResult {
            success: false,
            endpoint,
            image_ref,
            k8s_namespace,
            scan_report,
            steps,
            error,
        }
    }

    async fn log_stage(&self, session_id: &str, tool_name: &str, step: WorkflowStep) {
        let success = step.status == crate::steps::StepStatus::Completed;
        let error = step.error.clone();
        let execution = ToolExecution::start(tool_name, false).finish(success, error, 0);
        let _ = self
            .session_manager
            .update(session_id, move |session: &mut Session| {
                session.stage_history.push(execution.clone());
                if !success {
                    session.last_error = execution.error.clone();
                }
            })
            .await;
    }

    async fn stash_dockerfile(&self, session_id: &str, dockerfile: String) {
        let _ = self.session_manager.update(session_id, move |session: &mut Session| session.dockerfile = Some(dockerfile)).await;
    }

    async fn stash_image_ref(&self, session_id: &str, image_ref: String) {
        let _ = self.session_manager.update(session_id, move |session: &mut Session| session.image_ref = Some(image_ref)).await;
    }

    async fn stash_manifests(&self, session_id: &str, manifests: Vec<String>) {
        let _ = self.session_manager.update(session_id, move |session: &mut Session| session.manifests = Some(manifests)).await;
    }

    async fn stash_scan_summary(&self, session_id: &str, summary: serde_json::Value) {
        let _ = self.session_manager.update(session_id, move |session: &mut Session| session.scan_summary = Some(summary)).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use containerize_core::{Classifier, FixRegistry};
    use containerize_session::{SessionManagerConfig, SessionStore};

    use super::*;
    use crate::adapters::{
        BuildResult, DefaultAnalyzerAdapter, DefaultBuildAdapter, DefaultClusterAdapter, DefaultDockerfileSynthesizer,
        DefaultKubectlAdapter, DefaultManifestSynthesizer, DefaultScannerAdapter, DefaultServiceEndpointAdapter,
    };

    async fn new_executor(build_adapter: Arc<dyn BuildAdapter>) -> (WorkflowExecutor, Arc<SessionManager>, String) {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn SessionStore> = Arc::new(containerize_session::MemoryStore::new());
        let session_manager = Arc::new(SessionManager::new(
            SessionManagerConfig { workspace_base: dir.path().to_path_buf(), ..Default::default() },
            store,
        ));
        let session = session_manager.get_or_create("").await.unwrap();

        let coordinator = Arc::new(RetryCoordinator::new(Arc::new(Classifier::new()), Arc::new(FixRegistry::new())));
        let executor = WorkflowExecutor::new(
            coordinator,
            Arc::clone(&session_manager),
            Arc::new(DefaultAnalyzerAdapter),
            Arc::new(DefaultDockerfileSynthesizer),
            build_adapter,
            Arc::new(DefaultClusterAdapter),
            Arc::new(DefaultManifestSynthesizer::default()),
            Arc::new(DefaultKubectlAdapter),
            Arc::new(DefaultServiceEndpointAdapter),
            Arc::new(DefaultScannerAdapter),
        );
        (executor, session_manager, session.session_id)
    }

    /// S1 — a full successful run with `scan=false` still reports all ten
    /// steps, with the correct endpoint and image reference.
    #[tokio::test]
    async fn s1_full_success_reports_ten_steps_even_without_scan() {
        let (executor, _mgr, session_id) = new_executor(Arc::new(DefaultBuildAdapter)).await;
        let cancel = CancellationToken::new();
        let result = executor
            .containerize_and_deploy(&session_id, "https://example.test/hello-world.git", None, false, &cancel, &silent_progress_sink())
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.steps.len(), 10);
        assert_eq!(result.endpoint.as_deref(), Some("http://localhost:30080"));
        assert_eq!(result.image_ref.as_deref(), Some("localhost:5001/hello-world:latest"));
        assert_eq!(result.steps[8].status, crate::steps::StepStatus::Completed);
        assert!(result.steps[8].message.contains("skipped"));
    }

    struct FlakyTwiceBuildAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl BuildAdapter for FlakyTwiceBuildAdapter {
        async fn build(&self, _dockerfile: &str, image_name: &str, _context: &mut serde_json::Map<String, serde_json::Value>) -> anyhow::Result<BuildResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < 2 {
                anyhow::bail!("timeout");
            }
            Ok(BuildResult { image_ref: format!("localhost:5001/{image_name}:latest") })
        }
    }

    /// S2 — the build adapter fails twice with a retryable error then
    /// succeeds; the build step records two retries and the run succeeds.
    #[tokio::test]
    async fn s2_transient_build_failure_is_retried_and_recorded() {
        let (executor, _mgr, session_id) =
            new_executor(Arc::new(FlakyTwiceBuildAdapter { calls: AtomicU32::new(0) })).await;
        let cancel = CancellationToken::new();
        let result = executor
            .containerize_and_deploy(&session_id, "https://example.test/hello-world.git", None, false, &cancel, &silent_progress_sink())
            .await
            .unwrap();

        assert!(result.success);
        let build_step = result.steps.iter().find(|s| s.name == "build_image").unwrap();
        assert_eq!(build_step.retries, 2);
    }

    struct AlwaysInvalidBuildAdapter;

    #[async_trait]
    impl BuildAdapter for AlwaysInvalidBuildAdapter {
        async fn build(&self, _dockerfile: &str, _image_name: &str, _context: &mut serde_json::Map<String, serde_json::Value>) -> anyhow::Result<BuildResult> {
            anyhow::bail!("invalid syntax in Dockerfile")
        }
    }

    /// S3 — a non-retryable (validation) build failure stops the run at
    /// step 3 with zero retries recorded.
    #[tokio::test]
    async fn s3_non_retryable_build_failure_stops_short() {
        let (executor, _mgr, session_id) = new_executor(Arc::new(AlwaysInvalidBuildAdapter)).await;
        let cancel = CancellationToken::new();
        let result = executor
            .containerize_and_deploy(&session_id, "https://example.test/hello-world.git", None, false, &cancel, &silent_progress_sink())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.steps.len(), 3);
        let build_step = result.steps.last().unwrap();
        assert_eq!(build_step.status, crate::steps::StepStatus::Failed);
        assert_eq!(build_step.retries, 0);
    }

    struct CancelMidBuildAdapter {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl BuildAdapter for CancelMidBuildAdapter {
        async fn build(&self, _dockerfile: &str, _image_name: &str, _context: &mut serde_json::Map<String, serde_json::Value>) -> anyhow::Result<BuildResult> {
            self.cancel.cancel();
            anyhow::bail!("timeout")
        }
    }

    /// S4 — cancelling mid-build returns a failed result whose last step
    /// mentions the cancellation, without starting step 4.
    #[tokio::test]
    async fn s4_cancellation_mid_build_stops_the_pipeline() {
        let cancel = CancellationToken::new();
        let (executor, _mgr, session_id) = new_executor(Arc::new(CancelMidBuildAdapter { cancel: cancel.clone() })).await;
        let result = executor
            .containerize_and_deploy(&session_id, "https://example.test/hello-world.git", None, false, &cancel, &silent_progress_sink())
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.steps.len(), 3);
        let last = result.steps.last().unwrap();
        assert_eq!(last.status, crate::steps::StepStatus::Failed);
        assert!(last.error.as_deref().unwrap_or_default().contains("cancel") || last.error.as_deref().unwrap_or_default().contains("timeout"));
    }
}
