//! Declarative loader that turns a parsed [`EngineConfig`] into a registry of named retry/hedging
//! policies plus a `(service, method) -> Dispatch` lookup table.
//!
//! Grounded in the source's `retryHedgingManager`/`Setup`, minus the process-wide singleton and
//! plugin-framework registration: [`PolicyManager`] is an ordinary value the embedding
//! application constructs once (typically wrapped in an `Arc`) and hands to the filter layer,
//! rather than a package-level global built from a factory callback.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::backoff::{Backoff, BackoffBuildError};
use crate::config::{EngineConfig, HedgingCfg, RetryCfg, RetryHedgingCfg, ThrottleCfg};
use crate::policy::{
    ErrorCodeFn, HedgingPolicy, HedgingPolicyBuilder, PolicyBuildError, RetryPolicy,
    RetryPolicyBuilder,
};
use crate::sliding_window::SlidingWindowCounter;
use crate::throttle::{NoopThrottle, Throttle, ThrottleBuildError, TokenBucketThrottle};

const DEFAULT_MAX_TOKENS: f64 = 10.0;
const DEFAULT_TOKEN_RATIO: f64 = 0.1;

/// Rolling window a service's attempt-rate gauge is computed over.
const ATTEMPT_RATE_WINDOW: Duration = Duration::from_secs(10);

/// What the filter layer should do for a given `(service, method)` pair. The `SlidingWindowCounter`
/// is shared by every dispatch for the same service, feeding the `attemptRateWindow` gauge each
/// invocation reports (see [`crate::observability::Reporter::report`]).
pub enum Dispatch<Rsp, E> {
    Retry(Arc<RetryPolicy<Rsp, E>>, Arc<dyn Throttle>, Arc<SlidingWindowCounter>),
    Hedging(Arc<HedgingPolicy<Rsp, E>>, Arc<dyn Throttle>, Arc<SlidingWindowCounter>),
    /// No retry/hedging configured for this pair: call the handler once and return its result.
    PassThrough,
}

impl<Rsp, E> Clone for Dispatch<Rsp, E> {
    fn clone(&self) -> Self {
        match self {
            Self::Retry(policy, throttle, window) => {
                Self::Retry(policy.clone(), throttle.clone(), window.clone())
            }
            Self::Hedging(policy, throttle, window) => {
                Self::Hedging(policy.clone(), throttle.clone(), window.clone())
            }
            Self::PassThrough => Self::PassThrough,
        }
    }
}

struct ServiceEntry<Rsp, E> {
    throttle: Arc<dyn Throttle>,
    window: Arc<SlidingWindowCounter>,
    default: Dispatch<Rsp, E>,
    methods: HashMap<String, Dispatch<Rsp, E>>,
}

/// Errors raised while building a [`PolicyManager`] from a config document.
#[derive(Debug)]
pub enum ManagerBuildError {
    Backoff(BackoffBuildError),
    Throttle(ThrottleBuildError),
    Policy(PolicyBuildError),
}

impl fmt::Display for ManagerBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff(e) => write!(f, "failed to build backoff: {}", e),
            Self::Throttle(e) => write!(f, "failed to build throttle: {}", e),
            Self::Policy(e) => write!(f, "failed to build retry/hedging policy: {}", e),
        }
    }
}

impl std::error::Error for ManagerBuildError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backoff(e) => Some(e),
            Self::Throttle(e) => Some(e),
            Self::Policy(e) => Some(e),
        }
    }
}

impl From<BackoffBuildError> for ManagerBuildError {
    fn from(e: BackoffBuildError) -> Self {
        Self::Backoff(e)
    }
}

impl From<ThrottleBuildError> for ManagerBuildError {
    fn from(e: ThrottleBuildError) -> Self {
        Self::Throttle(e)
    }
}

impl From<PolicyBuildError> for ManagerBuildError {
    fn from(e: PolicyBuildError) -> Self {
        Self::Policy(e)
    }
}

/// Errors raised looking up a named policy that does not exist, used by the runtime-override
/// setters in [`crate::runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyNotFound(pub String);

impl fmt::Display for PolicyNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "policy {:?} is not found", self.0)
    }
}

impl std::error::Error for PolicyNotFound {}

/// Owned registry of named retry/hedging policies plus a `(service, method)` dispatch table,
/// built once from an [`EngineConfig`] document.
pub struct PolicyManager<Rsp, E> {
    retries: HashMap<String, Arc<RetryPolicy<Rsp, E>>>,
    hedges: HashMap<String, Arc<HedgingPolicy<Rsp, E>>>,
    services: HashMap<String, ServiceEntry<Rsp, E>>,
}

impl<Rsp, E> PolicyManager<Rsp, E>
where
    Rsp: Send + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    /// Build a manager from a parsed config document. `code_fn` maps a handler error to the
    /// integer code retryable/non-fatal classification is keyed on; it is shared by every
    /// policy the manager constructs, matching the source's single codec-level error-code
    /// extraction used across all retry/hedging instances.
    pub fn from_config(
        config: &EngineConfig,
        code_fn: ErrorCodeFn<E>,
    ) -> Result<Self, ManagerBuildError> {
        let mut manager = Self { retries: HashMap::new(), hedges: HashMap::new(), services: HashMap::new() };

        for service_cfg in &config.services {
            let mut service_cfg = service_cfg.clone();
            service_cfg.repair();

            if !manager.services.contains_key(&service_cfg.name) {
                let throttle = build_throttle(&service_cfg.throttle)?;
                let window = Arc::new(SlidingWindowCounter::new(ATTEMPT_RATE_WINDOW));
                let default =
                    manager.new_dispatch(&service_cfg.retry_hedging, &throttle, &window, &code_fn)?;
                manager.services.insert(
                    service_cfg.name.clone(),
                    ServiceEntry { throttle, window, default, methods: HashMap::new() },
                );
            } else {
                let throttle = manager.services[&service_cfg.name].throttle.clone();
                let window = manager.services[&service_cfg.name].window.clone();
                let default =
                    manager.new_dispatch(&service_cfg.retry_hedging, &throttle, &window, &code_fn)?;
                manager.services.get_mut(&service_cfg.name).unwrap().default = default;
            }

            let throttle = manager.services[&service_cfg.name].throttle.clone();
            let window = manager.services[&service_cfg.name].window.clone();
            for method_cfg in &service_cfg.methods {
                let Some(rh) = &method_cfg.retry_hedging else { continue };
                let dispatch = manager.new_dispatch(rh, &throttle, &window, &code_fn)?;
                manager
                    .services
                    .get_mut(&service_cfg.name)
                    .unwrap()
                    .methods
                    .insert(method_cfg.callee.clone(), dispatch);
            }
        }

        Ok(manager)
    }

    /// Look up the dispatch a `(service, method)` pair should use. Absent services fall back to
    /// pass-through (equivalent to no engine configured at all).
    pub fn dispatch(&self, service: &str, method: &str) -> Dispatch<Rsp, E> {
        let Some(entry) = self.services.get(service) else {
            return Dispatch::PassThrough;
        };
        entry.methods.get(method).cloned().unwrap_or_else(|| entry.default.clone())
    }

    /// Named retry policy, if one was registered under this name.
    pub fn retry_policy(&self, name: &str) -> Option<Arc<RetryPolicy<Rsp, E>>> {
        self.retries.get(name).cloned()
    }

    /// Named hedging policy, if one was registered under this name.
    pub fn hedging_policy(&self, name: &str) -> Option<Arc<HedgingPolicy<Rsp, E>>> {
        self.hedges.get(name).cloned()
    }

    /// Every registered retry policy name.
    pub fn retry_names(&self) -> impl Iterator<Item = &str> {
        self.retries.keys().map(String::as_str)
    }

    /// Every registered hedging policy name.
    pub fn hedging_names(&self) -> impl Iterator<Item = &str> {
        self.hedges.keys().map(String::as_str)
    }

    /// A present `retry` wins over a present `hedging`; neither present means pass-through.
    fn new_dispatch(
        &mut self,
        cfg: &RetryHedgingCfg,
        throttle: &Arc<dyn Throttle>,
        window: &Arc<SlidingWindowCounter>,
        code_fn: &ErrorCodeFn<E>,
    ) -> Result<Dispatch<Rsp, E>, ManagerBuildError> {
        if let Some(retry_cfg) = &cfg.retry {
            let mut retry_cfg = retry_cfg.clone();
            retry_cfg.repair();
            return Ok(Dispatch::Retry(
                self.new_retry(retry_cfg, code_fn)?,
                throttle.clone(),
                window.clone(),
            ));
        }
        if let Some(hedging_cfg) = &cfg.hedging {
            let mut hedging_cfg = hedging_cfg.clone();
            hedging_cfg.repair();
            return Ok(Dispatch::Hedging(
                self.new_hedging(hedging_cfg, code_fn)?,
                throttle.clone(),
                window.clone(),
            ));
        }
        Ok(Dispatch::PassThrough)
    }

    fn new_retry(
        &mut self,
        cfg: RetryCfg,
        code_fn: &ErrorCodeFn<E>,
    ) -> Result<Arc<RetryPolicy<Rsp, E>>, ManagerBuildError> {
        if let Some(existing) = self.retries.get(&cfg.name) {
            return Ok(existing.clone());
        }

        let mut builder = RetryPolicyBuilder::<Rsp, E>::new(cfg.max_attempts).name(cfg.name.clone());
        if let Some(exponential) = &cfg.backoff.exponential {
            let backoff =
                Backoff::exponential(exponential.initial, exponential.maximum, exponential.multiplier)?;
            builder = builder.backoff(backoff);
        } else if !cfg.backoff.linear.is_empty() {
            let table: Vec<Duration> = cfg.backoff.linear.iter().map(|d| d.0).collect();
            builder = builder.backoff(Backoff::linear(table)?);
        }
        builder = builder.retryable_codes(cfg.retryable_error_codes.iter().copied(), code_fn.clone());
        if let Some(skip) = cfg.skip_visited_nodes {
            builder = builder.skip_visited_nodes(skip);
        }

        let policy = Arc::new(builder.build()?);
        self.retries.insert(cfg.name, policy.clone());
        Ok(policy)
    }

    fn new_hedging(
        &mut self,
        cfg: HedgingCfg,
        code_fn: &ErrorCodeFn<E>,
    ) -> Result<Arc<HedgingPolicy<Rsp, E>>, ManagerBuildError> {
        if let Some(existing) = self.hedges.get(&cfg.name) {
            return Ok(existing.clone());
        }

        let mut builder = HedgingPolicyBuilder::<Rsp, E>::new(cfg.max_attempts)
            .name(cfg.name.clone())
            .static_delay(cfg.hedging_delay);
        builder = builder.non_fatal_codes(cfg.non_fatal_error_codes.iter().copied(), code_fn.clone());
        if let Some(skip) = cfg.skip_visited_nodes {
            builder = builder.skip_visited_nodes(skip);
        }

        let policy = Arc::new(builder.build()?);
        self.hedges.insert(cfg.name, policy.clone());
        Ok(policy)
    }
}

/// Mirrors the source's `newThrottle`: absent config gets the default token bucket, an
/// explicitly-zeroed block disables throttling, anything else repairs zeroed fields and builds a
/// token bucket.
fn build_throttle(cfg: &Option<ThrottleCfg>) -> Result<Arc<dyn Throttle>, ManagerBuildError> {
    match cfg {
        None => Ok(Arc::new(TokenBucketThrottle::new(DEFAULT_MAX_TOKENS, DEFAULT_TOKEN_RATIO)?)),
        Some(c) if c.max_tokens == 0.0 && c.token_ratio == 0.0 => Ok(Arc::new(NoopThrottle)),
        Some(c) => {
            let mut c = c.clone();
            c.repair();
            Ok(Arc::new(TokenBucketThrottle::new(c.max_tokens, c.token_ratio)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(i32);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "error {}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    fn code_of(e: &TestError) -> i32 {
        e.0
    }

    const DOC: &str = r#"
services:
  - name: trpc.test.greeter
    retry_hedging:
      retry:
        name: shared-retry
        max_attempts: 3
        backoff:
          linear: ["10ms"]
        retryable_error_codes: [21]
    methods:
      - callee: SayHello
        retry_hedging:
          hedging:
            max_attempts: 2
            hedging_delay: "50ms"
            non_fatal_error_codes: [21]
      - callee: SayGoodbye
"#;

    #[test]
    fn builds_service_default_and_method_override() {
        let config = EngineConfig::from_yaml(DOC).unwrap();
        let manager: PolicyManager<u32, TestError> =
            PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();

        match manager.dispatch("trpc.test.greeter", "SayHello") {
            Dispatch::Hedging(policy, _, _) => assert_eq!(policy.max_attempts, 2),
            _ => panic!("expected a hedging dispatch"),
        }
        match manager.dispatch("trpc.test.greeter", "SayGoodbye") {
            Dispatch::Retry(policy, _, _) => assert_eq!(policy.name, "shared-retry"),
            _ => panic!("expected the service default retry dispatch"),
        }
    }

    #[test]
    fn unknown_service_is_pass_through() {
        let config = EngineConfig::from_yaml(DOC).unwrap();
        let manager: PolicyManager<u32, TestError> =
            PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
        assert!(matches!(manager.dispatch("unknown.service", "Method"), Dispatch::PassThrough));
    }

    #[test]
    fn named_retry_policies_are_deduplicated() {
        let doc = r#"
services:
  - name: svc-a
    retry_hedging:
      retry: { name: shared, max_attempts: 2, backoff: { linear: ["5ms"] }, retryable_error_codes: [1] }
  - name: svc-b
    retry_hedging:
      retry: { name: shared, max_attempts: 2, backoff: { linear: ["5ms"] }, retryable_error_codes: [1] }
"#;
        let config = EngineConfig::from_yaml(doc).unwrap();
        let manager: PolicyManager<u32, TestError> =
            PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
        assert_eq!(manager.retry_names().count(), 1);
    }
}
