//! End-to-end coverage of the full stack: a YAML config document loaded into a
//! [`PolicyManager`], wrapped in a [`RetryHedgingEngine`], driving a plain async handler. Each
//! module's own `#[cfg(test)]` suite covers unit-level behavior; these exercise the pieces
//! wired together the way an embedding application actually would.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ninelives::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
struct CallError {
    code: i32,
    pushback: Option<&'static str>,
}

impl CallError {
    fn new(code: i32) -> Self {
        Self { code, pushback: None }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call failed with code {}", self.code)
    }
}

impl std::error::Error for CallError {}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Msg(u32);

impl ForkableMessage for Msg {
    fn fork(&self) -> Self {
        self.clone()
    }
    fn commit_back(&mut self, winner: &Self) {
        *self = winner.clone();
    }
}

fn code_of(e: &CallError) -> i32 {
    e.code
}

fn ctx(callee: &str, method: &str) -> FilterContext {
    FilterContext::new(ReportContext { caller: "it".into(), callee: callee.into(), method: method.into() })
}

fn outcome(result: Result<u32, CallError>) -> AttemptOutcome<u32, CallError> {
    let metadata = match &result {
        Err(e) if e.pushback.is_some() => {
            let mut m = std::collections::HashMap::new();
            m.insert(PUSHBACK_KEY.to_string(), e.pushback.unwrap().to_string());
            m
        }
        _ => Default::default(),
    };
    AttemptOutcome { result, metadata }
}

const RETRY_DOC: &str = r#"
services:
  - name: catalog
    retry_hedging:
      retry:
        name: catalog-retry
        max_attempts: 3
        backoff: { linear: ["1ms", "2ms"] }
        retryable_error_codes: [21]
"#;

// S1. Retry commits first success.
#[tokio::test]
async fn retry_commits_first_success() {
    let config = EngineConfig::from_yaml(RETRY_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let calls = calls2.clone();
        Box::pin(async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            outcome(if n == 0 { Err(CallError::new(21)) } else { Ok(7) })
        })
    });

    let result = engine.invoke(&ctx("catalog", "Get"), &mut Msg(1), handler).await;
    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// S2. Retry exhaustion.
#[tokio::test]
async fn retry_exhausts_after_max_attempts() {
    let config = EngineConfig::from_yaml(RETRY_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let calls = calls2.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome(Err(CallError::new(21)))
        })
    });

    let result = engine.invoke(&ctx("catalog", "Get"), &mut Msg(1), handler).await;
    assert!(matches!(result.unwrap_err(), EngineError::RetryableExhausted { attempts: 3, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

const THROTTLED_RETRY_DOC: &str = r#"
services:
  - name: inventory
    throttle:
      max_tokens: 10.0
      token_ratio: 1.0
    retry_hedging:
      retry:
        name: inventory-retry
        max_attempts: 3
        backoff: { linear: ["1ms"] }
        retryable_error_codes: [21]
"#;

// S6. Throttle suppression: a pre-depleted bucket still lets exactly one attempt through, and
// the resulting stat records throttled == true.
#[tokio::test]
async fn throttle_suppression_allows_exactly_one_attempt() {
    let config = EngineConfig::from_yaml(THROTTLED_RETRY_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();

    match manager.dispatch("inventory", "Get") {
        Dispatch::Retry(_, throttle, _) => {
            for _ in 0..6 {
                throttle.on_failure();
            }
            assert!(!throttle.allow());
        }
        _ => panic!("expected a retry dispatch"),
    }

    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));
    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let calls = calls2.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome(Err(CallError::new(21)))
        })
    });

    let result = engine.invoke(&ctx("inventory", "Get"), &mut Msg(1), handler).await;
    assert!(matches!(result.unwrap_err(), EngineError::RetryableExhausted { attempts: 1, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

const HEDGE_DOC: &str = r#"
services:
  - name: search
    retry_hedging:
      hedging:
        name: search-hedge
        max_attempts: 3
        hedging_delay: "5ms"
        non_fatal_error_codes: [21]
"#;

// S3. Hedging wins with the fastest attempt, regardless of spawn order.
#[tokio::test]
async fn hedging_commits_fastest_attempt() {
    let config = EngineConfig::from_yaml(HEDGE_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let next_index = Arc::new(AtomicUsize::new(1));
    let next_index2 = next_index.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let index = next_index2.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let delay_ms: u64 = match index {
                1 => 30,
                2 => 15,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            outcome(Ok(index as u32))
        })
    });

    let result = engine.invoke(&ctx("search", "Query"), &mut Msg(1), handler).await;
    assert_eq!(result.unwrap(), 3);
}

// S4. Hedging fatal short-circuit: a non-retryable error beats an in-flight slow success.
#[tokio::test]
async fn hedging_fatal_error_short_circuits() {
    let config = EngineConfig::from_yaml(HEDGE_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let next_index = Arc::new(AtomicUsize::new(1));
    let next_index2 = next_index.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let index = next_index2.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            match index {
                1 => outcome(Err(CallError::new(21))),
                2 => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    outcome(Err(CallError::new(500)))
                }
                _ => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    outcome(Ok(9))
                }
            }
        })
    });

    let result = engine.invoke(&ctx("search", "Query"), &mut Msg(1), handler).await;
    assert_eq!(result.unwrap_err(), EngineError::Fatal(CallError::new(500)));
}

// S5. Pushback stops hedging before a third attempt is spawned.
#[tokio::test]
async fn pushback_stops_further_hedging_attempts() {
    let config = EngineConfig::from_yaml(HEDGE_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts2 = attempts.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let index = attempts2.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            match index {
                0 => outcome(Err(CallError::new(21))),
                _ => {
                    let mut e = CallError::new(21);
                    e.pushback = Some("-1ms");
                    outcome(Err(e))
                }
            }
        })
    });

    let result = engine.invoke(&ctx("search", "Query"), &mut Msg(1), handler).await;
    assert!(result.is_err());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

// S7 (invariant 7). A disabled context bypasses retry/hedging entirely, even for a configured
// service/method, and the handler is invoked exactly once.
#[tokio::test]
async fn disabled_context_is_pure_pass_through() {
    let config = EngineConfig::from_yaml(RETRY_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    let handler: Handler<Msg, u32, CallError> = Arc::new(move |_req| {
        let calls = calls2.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            outcome(Err(CallError::new(21)))
        })
    });

    let disabled = with_disabled(ctx("catalog", "Get"));
    assert!(is_disabled(&disabled));
    let result = engine.invoke(&disabled, &mut Msg(1), handler).await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// Unconfigured (service, method) pairs pass straight through without consulting any policy.
#[tokio::test]
async fn unconfigured_pair_passes_through() {
    let config = EngineConfig::from_yaml(RETRY_DOC).unwrap();
    let manager: PolicyManager<u32, CallError> =
        PolicyManager::from_config(&config, Arc::new(code_of)).unwrap();
    let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(InstantSleeper));

    let handler: Handler<Msg, u32, CallError> =
        Arc::new(move |_req| Box::pin(async move { outcome(Ok(11)) }));

    let result = engine.invoke(&ctx("unrelated-service", "Get"), &mut Msg(1), handler).await;
    assert_eq!(result.unwrap(), 11);
}
