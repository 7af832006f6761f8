//! Workflow executor (C7): the fixed ten-step `containerize_and_deploy`
//! pipeline driven by the retry-and-fix coordinator.

pub mod adapters;
pub mod executor;
pub mod steps;

pub use adapters::{
    AnalyzeResult, AnalyzerAdapter, BuildAdapter, BuildResult, ClusterAdapter, ClusterInfo, DefaultAnalyzerAdapter,
    DefaultBuildAdapter, DefaultClusterAdapter, DefaultDockerfileSynthesizer, DefaultKubectlAdapter,
    DefaultManifestSynthesizer, DefaultScannerAdapter, DefaultServiceEndpointAdapter, DockerfileSynthesizer,
    KubectlAdapter, ManifestSynthesizer, ScanStatus, ScannerAdapter, ServiceEndpointAdapter, VulnerabilityFinding,
};
pub use executor::{silent_progress_sink, ContainerizeResult, ProgressSink, WorkflowExecutor};
pub use steps::{StepStatus, WorkflowStep, STEP_MAX_RETRIES, STEP_NAMES};
