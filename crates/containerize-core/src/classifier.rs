//! Error classifier (C1).
//!
//! Maps an error to a category tag plus `retryable`/`fixable` verdicts. Pure:
//! no I/O, no async, no locks beyond the pattern table's reader-writer lock.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// Fixed set of error categories. Closed: add new match arms, don't grow this
/// with a stringly-typed fallback — the wire value must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Network,
    Resource,
    Permission,
    Config,
    Dependency,
    Docker,
    Kubernetes,
    Git,
    Ai,
    Validation,
    Temporary,
    Internal,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Resource => "resource",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Config => "config",
            ErrorCategory::Dependency => "dependency",
            ErrorCategory::Docker => "docker",
            ErrorCategory::Kubernetes => "kubernetes",
            ErrorCategory::Git => "git",
            ErrorCategory::Ai => "ai",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Temporary => "temporary",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Fixed remediation priority: lower sorts first. Used by C2 when no
    /// explicit [`crate::fix::FixStrategy::priority`] breaks the tie across
    /// categories (e.g. ordering candidate providers before consulting any
    /// single provider's own strategies).
    pub fn remediation_priority(&self) -> u8 {
        match self {
            ErrorCategory::Validation => 0,
            ErrorCategory::Config => 1,
            ErrorCategory::Permission => 2,
            ErrorCategory::Dependency => 3,
            ErrorCategory::Docker => 4,
            ErrorCategory::Kubernetes => 5,
            ErrorCategory::Git => 6,
            ErrorCategory::Network => 7,
            ErrorCategory::Resource => 8,
            ErrorCategory::Temporary => 9,
            ErrorCategory::Ai => 10,
            ErrorCategory::Internal => 11,
            ErrorCategory::Unknown => 12,
        }
    }

    fn all() -> &'static [ErrorCategory] {
        &[
            ErrorCategory::Network,
            ErrorCategory::Resource,
            ErrorCategory::Permission,
            ErrorCategory::Config,
            ErrorCategory::Dependency,
            ErrorCategory::Docker,
            ErrorCategory::Kubernetes,
            ErrorCategory::Git,
            ErrorCategory::Ai,
            ErrorCategory::Validation,
            ErrorCategory::Temporary,
            ErrorCategory::Internal,
        ]
    }

    fn default_patterns(&self) -> &'static [&'static str] {
        match self {
            ErrorCategory::Network => &[
                "connection refused",
                "connection reset",
                "dns",
                "no route to host",
                "network is unreachable",
                "tls handshake",
            ],
            ErrorCategory::Resource => &[
                "out of memory",
                "no space left",
                "disk quota exceeded",
                "too many open files",
                "resource exhausted",
            ],
            ErrorCategory::Permission => &[
                "permission denied",
                "access denied",
                "forbidden",
                "unauthorized",
            ],
            ErrorCategory::Config => &[
                "invalid configuration",
                "missing required field",
                "unknown flag",
                "could not parse config",
            ],
            ErrorCategory::Dependency => &[
                "package not found",
                "module not found",
                "dependency resolution failed",
                "no matching version",
            ],
            ErrorCategory::Docker => &[
                "docker daemon",
                "docker build failed",
                "no such image",
                "manifest unknown",
                "layer does not exist",
            ],
            ErrorCategory::Kubernetes => &[
                "admission webhook",
                "crashloopbackoff",
                "imagepullbackoff",
                "no matches for kind",
                "field is immutable",
            ],
            ErrorCategory::Git => &[
                "repository not found",
                "could not read from remote repository",
                "fatal: not a git repository",
            ],
            ErrorCategory::Ai => &["model overloaded", "context length exceeded"],
            ErrorCategory::Validation => &[
                "invalid syntax",
                "invalid argument",
                "validation failed",
                "schema mismatch",
            ],
            ErrorCategory::Temporary => &["timeout", "try again", "temporarily unavailable"],
            ErrorCategory::Internal => &["internal error", "panic", "unreachable code"],
            ErrorCategory::Unknown => &[],
        }
    }
}

/// The classifier's verdict for one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub retryable: bool,
    pub fixable: bool,
}

impl Classification {
    fn for_category(category: ErrorCategory) -> Self {
        let retryable = matches!(
            category,
            ErrorCategory::Network
                | ErrorCategory::Temporary
                | ErrorCategory::Resource
                | ErrorCategory::Docker
                | ErrorCategory::Kubernetes
                | ErrorCategory::Git
        );
        let fixable = matches!(
            category,
            ErrorCategory::Config
                | ErrorCategory::Dependency
                | ErrorCategory::Docker
                | ErrorCategory::Permission
                | ErrorCategory::Validation
        );
        Classification {
            category,
            retryable,
            fixable,
        }
    }
}

/// An error that may carry its own structured category, bypassing message
/// pattern matching. Any crate's error type implements this to participate
/// in classification; [`str`] and [`String`] get a blanket impl below for
/// tests and ad hoc callers.
pub trait ClassifiableError {
    /// If the error already knows its category (e.g. it was produced by a
    /// typed adapter error), return it here and pattern matching is skipped.
    fn structured_category(&self) -> Option<ErrorCategory> {
        None
    }

    /// If the structured error also knows definitively whether it is
    /// retryable, override the category-derived default.
    fn structured_retryable(&self) -> Option<bool> {
        None
    }

    fn message(&self) -> String;
}

impl ClassifiableError for str {
    fn message(&self) -> String {
        self.to_string()
    }
}

impl ClassifiableError for String {
    fn message(&self) -> String {
        self.clone()
    }
}

impl ClassifiableError for anyhow::Error {
    fn message(&self) -> String {
        self.to_string()
    }
}

/// Runtime-extensible category -> substring pattern table.
pub struct Classifier {
    patterns: RwLock<HashMap<ErrorCategory, Vec<String>>>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        let mut patterns = HashMap::new();
        for category in ErrorCategory::all() {
            patterns.insert(
                *category,
                category
                    .default_patterns()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            );
        }
        Self {
            patterns: RwLock::new(patterns),
        }
    }

    /// Register an additional substring pattern for `category`. Patterns are
    /// matched lowercase; callers need not lowercase `pattern` themselves.
    pub fn add_pattern(&self, category: ErrorCategory, pattern: impl Into<String>) {
        let mut patterns = self.patterns.write().expect("classifier lock poisoned");
        patterns
            .entry(category)
            .or_default()
            .push(pattern.into().to_lowercase());
    }

    /// Classify an error. Structured overrides win outright; otherwise the
    /// lowercased message is matched against each category's pattern table
    /// in category-declaration order, and the first hit wins.
    pub fn classify(&self, error: &dyn ClassifiableError) -> Classification {
        if let Some(category) = error.structured_category() {
            let mut verdict = Classification::for_category(category);
            if let Some(retryable) = error.structured_retryable() {
                verdict.retryable = retryable;
            }
            return verdict;
        }

        let message = error.message().to_lowercase();
        let patterns = self.patterns.read().expect("classifier lock poisoned");
        for category in ErrorCategory::all() {
            if let Some(category_patterns) = patterns.get(category) {
                if category_patterns.iter().any(|p| message.contains(p.as_str())) {
                    return Classification::for_category(*category);
                }
            }
        }
        Classification::for_category(ErrorCategory::Unknown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totality_every_message_gets_a_verdict() {
        let classifier = Classifier::new();
        for message in [
            "",
            "something bizarre happened",
            "docker build failed: no such image",
            "connection refused",
            "invalid syntax near line 3",
        ] {
            let verdict = classifier.classify(&message.to_string() as &dyn ClassifiableError);
            // deterministic booleans, no panics — category may legitimately be unknown
            let _ = verdict.category;
            let _ = verdict.retryable;
            let _ = verdict.fixable;
        }
    }

    #[test]
    fn network_is_retryable_not_fixable() {
        let classifier = Classifier::new();
        let verdict = classifier.classify(&"connection refused by peer".to_string() as &dyn ClassifiableError);
        assert_eq!(verdict.category, ErrorCategory::Network);
        assert!(verdict.retryable);
        assert!(!verdict.fixable);
    }

    #[test]
    fn validation_is_fixable_not_retryable() {
        let classifier = Classifier::new();
        let verdict = classifier.classify(&"invalid syntax in Dockerfile".to_string() as &dyn ClassifiableError);
        assert_eq!(verdict.category, ErrorCategory::Validation);
        assert!(!verdict.retryable);
        assert!(verdict.fixable);
    }

    #[test]
    fn unknown_message_falls_back_deterministically() {
        let classifier = Classifier::new();
        let a = classifier.classify(&"wat".to_string() as &dyn ClassifiableError);
        let b = classifier.classify(&"wat".to_string() as &dyn ClassifiableError);
        assert_eq!(a, b);
        assert_eq!(a.category, ErrorCategory::Unknown);
    }

    #[test]
    fn add_pattern_extends_matching_at_runtime() {
        let classifier = Classifier::new();
        let before = classifier.classify(&"flux capacitor overloaded".to_string() as &dyn ClassifiableError);
        assert_eq!(before.category, ErrorCategory::Unknown);

        classifier.add_pattern(ErrorCategory::Docker, "flux capacitor");
        let after = classifier.classify(&"flux capacitor overloaded".to_string() as &dyn ClassifiableError);
        assert_eq!(after.category, ErrorCategory::Docker);
    }

    #[test]
    fn structured_category_bypasses_pattern_matching() {
        struct Structured;
        impl ClassifiableError for Structured {
            fn structured_category(&self) -> Option<ErrorCategory> {
                Some(ErrorCategory::Validation)
            }
            fn message(&self) -> String {
                "connection refused".to_string() // would match Network by text
            }
        }

        let classifier = Classifier::new();
        let verdict = classifier.classify(&Structured);
        assert_eq!(verdict.category, ErrorCategory::Validation);
    }

    #[test]
    fn remediation_priority_orders_validation_first() {
        assert!(ErrorCategory::Validation.remediation_priority() < ErrorCategory::Config.remediation_priority());
        assert!(ErrorCategory::Config.remediation_priority() < ErrorCategory::Network.remediation_priority());
    }
}
