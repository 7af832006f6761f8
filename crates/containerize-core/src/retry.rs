//! Retry-and-fix coordinator (C3).
//!
//! Grounded in `kftray-portforward::kube::proxy_recovery`: a per-key state
//! machine guarded by a short-lived lock, exponential backoff computed with
//! `saturating_mul`/`min`, and a cancellable sleep via `tokio::select!`.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classifier::{ClassifiableError, Classifier};
use crate::error::CoordinatorError;
use crate::fix::FixRegistry;

/// How a policy's per-attempt delay grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
}

/// A named policy keyed by `op_tag` (spec §3.1 / §4.3).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub strategy: RetryStrategy,
    pub multiplier: f64,
    pub jitter: bool,
    /// Substrings that classify an error message as retryable *for this
    /// policy*. Empty means "no additional restriction" — the classifier's
    /// verdict alone decides (see [`crate::classifier`] doc on the
    /// category/policy intersection).
    pub retryable_patterns: Vec<String>,
    pub circuit_threshold: u32,
    pub circuit_open_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: RetryStrategy::Exponential,
            multiplier: 2.0,
            jitter: true,
            retryable_patterns: Vec::new(),
            circuit_threshold: 5,
            circuit_open_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn is_message_retryable(&self, message: &str) -> bool {
        if self.retryable_patterns.is_empty() {
            return true;
        }
        let lower = message.to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }

    /// Computes the undithered delay for `attempt` (1-indexed), per spec
    /// property 2: fixed `{1,1,1,1,1}`, linear `{1,2,3,4,5}`, exponential
    /// `{1,2,4,8,10}` for initial=1s/multiplier=2/max=10s.
    fn base_delay(&self, attempt: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Fixed => self.initial_delay,
            RetryStrategy::Linear => self.initial_delay.saturating_mul(attempt),
            RetryStrategy::Exponential => {
                let factor = self.multiplier.powi(attempt as i32 - 1);
                Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            }
        };
        std::cmp::min(delay, self.max_delay)
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let half = base.as_secs_f64() / 2.0;
        let triple_half = base.as_secs_f64() * 1.5;
        let jittered = rand::thread_rng().gen_range(half..=triple_half.max(half));
        std::cmp::min(Duration::from_secs_f64(jittered), self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-operation circuit breaker (spec §3.1 / §4.3 state machine).
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub next_attempt: Instant,
    open_timeout: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, open_timeout: Duration) -> Self {
        CircuitBreaker {
            state: CircuitState::Closed,
            failure_count: 0,
            threshold,
            next_attempt: Instant::now(),
            open_timeout,
        }
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        if self.failure_count >= self.threshold || self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Open;
            self.next_attempt = Instant::now() + self.open_timeout;
        }
    }

    fn record_success(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
        }
        self.failure_count = 0;
    }
}

/// Per-call mutable context threaded through `ExecuteWithFix`'s closure:
/// the current attempt number, the previous attempt's error message (if
/// any), and the parameter map fix providers read and mutate.
pub struct RetryContext<'a> {
    pub attempt: u32,
    pub last_error: Option<String>,
    pub params: &'a mut Map<String, Value>,
}

/// Coordinates retries, circuit breaking, and (for `execute_with_fix`) fix
/// provider consultation, keyed by `op_tag`.
pub struct RetryCoordinator {
    policies: RwLock<HashMap<String, RetryPolicy>>,
    default_policy: RetryPolicy,
    breakers: DashMap<String, Arc<Mutex<CircuitBreaker>>>,
    classifier: Arc<Classifier>,
    fixes: Arc<FixRegistry>,
}

impl RetryCoordinator {
    pub fn new(classifier: Arc<Classifier>, fixes: Arc<FixRegistry>) -> Self {
        RetryCoordinator {
            policies: RwLock::new(HashMap::new()),
            default_policy: RetryPolicy::default(),
            breakers: DashMap::new(),
            classifier,
            fixes,
        }
    }

    pub fn set_policy(&self, op_tag: impl Into<String>, policy: RetryPolicy) {
        self.policies
            .write()
            .expect("policy lock poisoned")
            .insert(op_tag.into(), policy);
    }

    fn policy_for(&self, op_tag: &str) -> RetryPolicy {
        self.policies
            .read()
            .expect("policy lock poisoned")
            .get(op_tag)
            .cloned()
            .unwrap_or_else(|| self.default_policy.clone())
    }

    fn breaker_for(&self, op_tag: &str, policy: &RetryPolicy) -> Arc<Mutex<CircuitBreaker>> {
        self.breakers
            .entry(op_tag.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitBreaker::new(policy.circuit_threshold, policy.circuit_open_timeout))))
            .clone()
    }

    /// Read-only snapshot of the breaker for `op_tag`, for status tools and
    /// tests. Returns `None` if no call for that tag has happened yet.
    pub fn breaker_snapshot(&self, op_tag: &str) -> Option<CircuitBreaker> {
        self.breakers.get(op_tag).map(|entry| entry.lock().expect("breaker lock poisoned").clone())
    }

    /// `Execute(ctx, op_tag, fn)` — retries and circuit-breaks but never
    /// consults C2.
    pub async fn execute<T, F, Fut>(&self, op_tag: &str, cancel: &CancellationToken, f: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut f = f;
        let mut attempts = 0;
        self.run(op_tag, cancel, false, &mut attempts, move |_ctx| f()).await
    }

    /// `ExecuteWithFix(ctx, op_tag, fn)` — additionally invokes fix
    /// providers between attempts for errors that are both retryable and
    /// fixable.
    pub async fn execute_with_fix<T, F, Fut>(&self, op_tag: &str, cancel: &CancellationToken, f: F) -> anyhow::Result<T>
    where
        F: FnMut(&mut RetryContext<'_>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut attempts = 0;
        self.run(op_tag, cancel, true, &mut attempts, f).await
    }

    /// Same as [`Self::execute_with_fix`], but also reports the number of
    /// attempts the call actually made (1-indexed) through `attempts_out`,
    /// on both the success and the failure path. Callers that report a
    /// per-step retry count (spec §3.1's `ToolExecution`/`WorkflowStep`)
    /// should read `*attempts_out - 1` after the call returns, rather than
    /// the circuit breaker's cumulative `failure_count` — the breaker
    /// persists across calls and is reset on success, so it cannot answer
    /// "how many retries did *this* call take".
    pub async fn execute_with_fix_tracked<T, F, Fut>(
        &self,
        op_tag: &str,
        cancel: &CancellationToken,
        attempts_out: &mut u32,
        f: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut(&mut RetryContext<'_>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run(op_tag, cancel, true, attempts_out, f).await
    }

    async fn run<T, F, Fut>(
        &self,
        op_tag: &str,
        cancel: &CancellationToken,
        with_fix: bool,
        attempts_out: &mut u32,
        mut f: F,
    ) -> anyhow::Result<T>
    where
        F: FnMut(&mut RetryContext<'_>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let policy = self.policy_for(op_tag);
        let breaker = self.breaker_for(op_tag, &policy);
        let mut params = Map::new();
        let mut applied_keys: HashSet<String> = HashSet::new();
        let mut last_error: Option<String> = None;

        for attempt in 1..=policy.max_attempts {
            *attempts_out = attempt;
            {
                let mut guard = breaker.lock().expect("breaker lock poisoned");
                if guard.state == CircuitState::Open {
                    if Instant::now() < guard.next_attempt {
                        return Err(CoordinatorError::CircuitOpen { op_tag: op_tag.to_string() }.into());
                    }
                    guard.state = CircuitState::HalfOpen;
                    debug!(op_tag, "circuit half-open, allowing one probe");
                }
            }

            if cancel.is_cancelled() {
                return Err(CoordinatorError::Cancelled.into());
            }

            let mut ctx = RetryContext {
                attempt,
                last_error: last_error.clone(),
                params: &mut params,
            };
            let outcome = f(&mut ctx).await;

            match outcome {
                Ok(value) => {
                    let mut guard = breaker.lock().expect("breaker lock poisoned");
                    guard.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    let message = err.to_string();
                    last_error = Some(message.clone());

                    {
                        let mut guard = breaker.lock().expect("breaker lock poisoned");
                        guard.record_failure();
                    }

                    let verdict = self.classifier.classify(&message as &dyn ClassifiableError);
                    let retryable = verdict.retryable && policy.is_message_retryable(&message);

                    if !retryable {
                        warn!(op_tag, attempt, category = verdict.category.as_str(), "non-retryable failure");
                        return Err(err);
                    }

                    if attempt >= policy.max_attempts {
                        warn!(op_tag, attempt, "retries exhausted");
                        return Err(err.context(format!("{op_tag}: exhausted after {attempt} attempt(s)")));
                    }

                    if with_fix && verdict.fixable {
                        let applied = self
                            .fixes
                            .propose_and_apply(verdict.category, &message, &mut params, &mut applied_keys)
                            .await;
                        if applied {
                            info!(op_tag, attempt, "fix provider applied a remediation before retry");
                        }
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return Err(CoordinatorError::Cancelled.into());
                        }
                    }
                }
            }
        }

        unreachable!("loop always returns by attempt == max_attempts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fix::FixRegistry;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn coordinator() -> RetryCoordinator {
        RetryCoordinator::new(Arc::new(Classifier::new()), Arc::new(FixRegistry::new()))
    }

    #[test]
    fn retry_math_exponential() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            strategy: RetryStrategy::Exponential,
            jitter: false,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=5).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
    }

    #[test]
    fn retry_math_linear() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            strategy: RetryStrategy::Linear,
            jitter: false,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=5).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn retry_math_fixed() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            strategy: RetryStrategy::Fixed,
            jitter: false,
            ..RetryPolicy::default()
        };
        let delays: Vec<u64> = (1..=5).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 1, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_on_first_try_without_sleeping() {
        let coordinator = coordinator();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = coordinator
            .execute("unit_test_op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(42)
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_a_transient_failure_then_succeeds() {
        let coordinator = coordinator();
        coordinator.set_policy(
            "transient_op",
            RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(10),
                jitter: false,
                ..RetryPolicy::default()
            },
        );
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let handle = tokio::spawn(async move {
            coordinator
                .execute("transient_op", &cancel, || async {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(anyhow::anyhow!("connection refused"))
                    } else {
                        Ok::<_, anyhow::Error>(n)
                    }
                })
                .await
        });
        tokio::time::advance(Duration::from_secs(1)).await;
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_returns_immediately_without_exhausting_attempts() {
        let coordinator = coordinator();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = coordinator
            .execute("validation_op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("invalid syntax near line 2"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn circuit_opens_after_threshold_and_rejects_without_calling_fn() {
        let coordinator = coordinator();
        coordinator.set_policy(
            "flaky_op",
            RetryPolicy {
                max_attempts: 1,
                circuit_threshold: 2,
                ..RetryPolicy::default()
            },
        );
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let _ = coordinator
                .execute("flaky_op", &cancel, || async { Err::<(), _>(anyhow::anyhow!("timeout")) })
                .await;
        }

        let snapshot = coordinator.breaker_snapshot("flaky_op").unwrap();
        assert_eq!(snapshot.state, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let result = coordinator
            .execute("flaky_op", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_sleep_aborts_without_a_further_call() {
        let coordinator = coordinator();
        coordinator.set_policy(
            "cancellable_op",
            RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_secs(5),
                jitter: false,
                ..RetryPolicy::default()
            },
        );
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let cancel_clone = cancel.clone();

        let handle = tokio::spawn(async move {
            coordinator
                .execute("cancellable_op", &cancel_clone, || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(anyhow::anyhow!("connection reset"))
                    }
                })
                .await
        });

        tokio::task::yield_now().await;
        cancel.cancel();
        tokio::time::advance(Duration::from_secs(5)).await;
        let result = handle.await.unwrap();
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fix_provider_mutates_context_observed_by_next_attempt() {
        use crate::fix::providers::PortConflictFixProvider;

        let fixes = Arc::new(FixRegistry::new());
        fixes.register_category(crate::classifier::ErrorCategory::Docker, Arc::new(PortConflictFixProvider));
        let coordinator = RetryCoordinator::new(Arc::new(Classifier::new()), fixes);
        coordinator.set_policy(
            "build_image",
            RetryPolicy {
                max_attempts: 2,
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..RetryPolicy::default()
            },
        );
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let handle = tokio::spawn(async move {
            coordinator
                .execute_with_fix("build_image", &cancel, |ctx| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    let observed_port = ctx.params.get("port").and_then(Value::as_u64);
                    async move {
                        if n == 0 {
                            Err(anyhow::anyhow!("docker build failed: address already in use"))
                        } else {
                            Ok::<_, anyhow::Error>(observed_port)
                        }
                    }
                })
                .await
        });
        tokio::time::advance(Duration::from_millis(10)).await;
        let observed_port = handle.await.unwrap().unwrap();
        assert_eq!(observed_port, Some(8081));
    }
}
