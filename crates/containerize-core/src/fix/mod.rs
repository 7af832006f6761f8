//! Fix-provider registry (C2).

pub mod providers;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::classifier::ErrorCategory;

/// A remediation a provider offers. Lower `priority` is tried first;
/// `automated` breaks ties (automated strategies are preferred over ones
/// that merely describe a manual step).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FixStrategy {
    pub type_tag: String,
    pub name: String,
    pub description: String,
    pub priority: i32,
    pub automated: bool,
    pub parameters: Map<String, Value>,
}

impl FixStrategy {
    pub fn new(type_tag: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        FixStrategy {
            type_tag: type_tag.into(),
            name: name.into(),
            description: String::new(),
            priority,
            automated: true,
            parameters: Map::new(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn manual(mut self) -> Self {
        self.automated = false;
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Key used to deduplicate repeated `apply` calls within one attempt
    /// window: the caller-supplied `idempotency_key` parameter if present,
    /// otherwise `type_tag::name`.
    pub fn idempotency_key(&self) -> String {
        match self.parameters.get("idempotency_key").and_then(Value::as_str) {
            Some(key) => key.to_string(),
            None => format!("{}::{}", self.type_tag, self.name),
        }
    }
}

/// A pluggable advisor consulted between retry attempts. Must never panic
/// across the interface — propose/apply report failure as a `Result`/empty
/// vec, not an unwind.
#[async_trait]
pub trait FixProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Suggest zero or more remediations for `message`, given the shared
    /// mutable `context` map accumulated so far this attempt window.
    async fn propose(&self, message: &str, context: &Map<String, Value>) -> Vec<FixStrategy>;

    /// Apply one previously proposed strategy. May mutate `context` (e.g.
    /// write a suggested port back in) so the next retry attempt observes it.
    async fn apply(&self, strategy: &FixStrategy, context: &mut Map<String, Value>) -> Result<(), anyhow::Error>;
}

/// Providers keyed by the symbolic name they registered under — conventionally
/// the error category they handle (`"docker"`, `"config"`, ...), but callers
/// may register under any symbolic tag a classifier override might produce.
#[derive(Default)]
pub struct FixRegistry {
    providers: RwLock<HashMap<String, Vec<Arc<dyn FixProvider>>>>,
}

impl FixRegistry {
    pub fn new() -> Self {
        FixRegistry {
            providers: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, symbolic_name: impl Into<String>, provider: Arc<dyn FixProvider>) {
        self.providers
            .write()
            .expect("fix registry lock poisoned")
            .entry(symbolic_name.into())
            .or_default()
            .push(provider);
    }

    pub fn register_category(&self, category: ErrorCategory, provider: Arc<dyn FixProvider>) {
        self.register(category.as_str(), provider);
    }

    fn providers_for(&self, symbolic_name: &str) -> Vec<Arc<dyn FixProvider>> {
        self.providers
            .read()
            .expect("fix registry lock poisoned")
            .get(symbolic_name)
            .cloned()
            .unwrap_or_default()
    }

    /// Collect proposals from every provider registered for `category`, sort
    /// ascending by priority (automated-first tiebreak), then apply them in
    /// order until one succeeds. Strategies whose idempotency key is already
    /// in `applied` (from an earlier attempt in this same window) are
    /// skipped without calling `apply` again. Returns whether a strategy was
    /// applied.
    pub async fn propose_and_apply(
        &self,
        category: ErrorCategory,
        message: &str,
        context: &mut Map<String, Value>,
        applied: &mut HashSet<String>,
    ) -> bool {
        let providers = self.providers_for(category.as_str());
        if providers.is_empty() {
            return false;
        }

        let mut candidates: Vec<(Arc<dyn FixProvider>, FixStrategy)> = Vec::new();
        for provider in providers {
            for strategy in provider.propose(message, context).await {
                candidates.push((provider.clone(), strategy));
            }
        }
        candidates.sort_by(|a, b| {
            a.1.priority
                .cmp(&b.1.priority)
                .then_with(|| b.1.automated.cmp(&a.1.automated))
        });

        for (provider, strategy) in candidates {
            let key = strategy.idempotency_key();
            if applied.contains(&key) {
                continue;
            }
            match provider.apply(&strategy, context).await {
                Ok(()) => {
                    applied.insert(key);
                    return true;
                }
                Err(_) => continue,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysSucceeds;

    #[async_trait]
    impl FixProvider for AlwaysSucceeds {
        fn name(&self) -> &str {
            "always"
        }

        async fn propose(&self, _message: &str, _context: &Map<String, Value>) -> Vec<FixStrategy> {
            vec![
                FixStrategy::new("noop", "low_priority", 10),
                FixStrategy::new("noop", "high_priority", 1),
            ]
        }

        async fn apply(&self, strategy: &FixStrategy, context: &mut Map<String, Value>) -> Result<(), anyhow::Error> {
            context.insert("applied".to_string(), Value::String(strategy.name.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn applies_highest_priority_first() {
        let registry = FixRegistry::new();
        registry.register_category(ErrorCategory::Docker, Arc::new(AlwaysSucceeds));

        let mut context = Map::new();
        let mut applied = HashSet::new();
        let did_apply = registry
            .propose_and_apply(ErrorCategory::Docker, "manifest unknown", &mut context, &mut applied)
            .await;

        assert!(did_apply);
        assert_eq!(context.get("applied").and_then(Value::as_str), Some("high_priority"));
    }

    #[tokio::test]
    async fn unregistered_category_applies_nothing() {
        let registry = FixRegistry::new();
        let mut context = Map::new();
        let mut applied = HashSet::new();
        let did_apply = registry
            .propose_and_apply(ErrorCategory::Network, "connection refused", &mut context, &mut applied)
            .await;
        assert!(!did_apply);
    }

    struct AlwaysFails;

    #[async_trait]
    impl FixProvider for AlwaysFails {
        fn name(&self) -> &str {
            "never"
        }

        async fn propose(&self, _message: &str, _context: &Map<String, Value>) -> Vec<FixStrategy> {
            vec![FixStrategy::new("noop", "only", 1)]
        }

        async fn apply(&self, _strategy: &FixStrategy, _context: &mut Map<String, Value>) -> Result<(), anyhow::Error> {
            Err(anyhow::anyhow!("cannot apply"))
        }
    }

    #[tokio::test]
    async fn a_failing_apply_does_not_poison_the_applied_set() {
        let registry = FixRegistry::new();
        registry.register_category(ErrorCategory::Config, Arc::new(AlwaysFails));

        let mut context = Map::new();
        let mut applied = HashSet::new();
        let did_apply = registry
            .propose_and_apply(ErrorCategory::Config, "invalid configuration", &mut context, &mut applied)
            .await;
        assert!(!did_apply);
        assert!(applied.is_empty());
    }

    #[tokio::test]
    async fn idempotency_key_prevents_reapplication_within_a_window() {
        let registry = FixRegistry::new();
        registry.register_category(ErrorCategory::Docker, Arc::new(AlwaysSucceeds));

        let mut context = Map::new();
        let mut applied = HashSet::new();
        registry
            .propose_and_apply(ErrorCategory::Docker, "manifest unknown", &mut context, &mut applied)
            .await;
        assert_eq!(applied.len(), 1);

        // Same window, second attempt: the already-applied high-priority
        // strategy must be skipped in favor of the next one.
        let did_apply = registry
            .propose_and_apply(ErrorCategory::Docker, "manifest unknown", &mut context, &mut applied)
            .await;
        assert!(did_apply);
        assert_eq!(applied.len(), 2);
    }
}
