#![forbid(unsafe_code)]

//! # Nine Lives 🐱
//!
//! A client-side retry and hedging engine for RPC invocations: sequential retry with pluggable
//! backoff/classification/server-pushback handling, concurrent hedging with speculative
//! overlapping attempts, and an adaptive token-bucket throttle shared between them so retries and
//! hedges never amplify an already-struggling downstream.
//!
//! ## Features
//!
//! - **Retry** (sequential, one attempt at a time) and **hedging** (concurrent, overlapping
//!   attempts) executors sharing the same policy/throttle/observability plumbing
//! - **Backoff strategies** (linear, exponential, customized) and **pluggable error
//!   classification** keyed off an application-supplied error code
//! - **Server pushback**: a downstream can request "no more attempts" or a specific retry delay
//!   via response metadata, and both executors honor it
//! - **`PolicyManager`**: builds a `(service, method) -> policy` registry from a YAML config
//!   document, with runtime setters for every pluggable function a policy carries
//! - **`ClientFilter`**, plus a `tower_service::Service` adapter, as the embedding point
//! - **Lock-free adaptive config** for live policy overrides, via `ArcSwap`
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use ninelives::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, Eq)]
//! struct MyError(i32);
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "error {}", self.0)
//!     }
//! }
//! impl std::error::Error for MyError {}
//!
//! #[derive(Clone)]
//! struct Req(u32);
//! impl ForkableMessage for Req {
//!     fn fork(&self) -> Self { self.clone() }
//!     fn commit_back(&mut self, winner: &Self) { *self = winner.clone(); }
//! }
//!
//! const DOC: &str = r#"
//! services:
//!   - name: my-service
//!     retry_hedging:
//!       retry:
//!         name: default
//!         max_attempts: 3
//!         backoff: { exponential: { initial: "10ms", maximum: "1s", multiplier: 2.0 } }
//!         retryable_error_codes: [1]
//! "#;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::from_yaml(DOC)?;
//!     let manager: PolicyManager<u32, MyError> =
//!         PolicyManager::from_config(&config, Arc::new(|e: &MyError| e.0))?;
//!     let engine = RetryHedgingEngine::new(Arc::new(manager), Arc::new(TokioSleeper));
//!
//!     let ctx = FilterContext::new(ReportContext {
//!         caller: "demo".into(),
//!         callee: "my-service".into(),
//!         method: "Get".into(),
//!     });
//!     let handler: Handler<Req, u32, MyError> =
//!         Arc::new(|_req| Box::pin(async { AttemptOutcome { result: Ok(42), metadata: Default::default() } }));
//!
//!     let rsp = engine.invoke(&ctx, &mut Req(0), handler).await?;
//!     assert_eq!(rsp, 42);
//!     Ok(())
//! }
//! ```

mod adaptive;
mod backoff;
mod cancellation;
mod config;
mod error;
mod filter;
mod hedging;
mod manager;
mod message;
mod observability;
mod policy;
mod pushback;
mod retry;
mod runtime;
mod sleeper;
mod sliding_window;
mod throttle;

// Re-exports
pub use adaptive::Adaptive;
pub use backoff::{Backoff, BackoffBuildError, MAX_BACKOFF};
pub use cancellation::{Cancellation, DoneReason};
pub use config::{
    BackoffCfg, ConfigError, EngineConfig, ExponentialBackoffCfg, HedgingCfg, HumanDuration,
    MethodCfg, RetryCfg, RetryHedgingCfg, ServiceCfg, ThrottleCfg,
};
pub use error::{EngineError, MAX_RETRY_FAILURES};
pub use filter::{
    with_disabled, is_disabled, ClientFilter, FilterContext, FilterLayer, FilterRequest,
    FilterService, RetryHedgingEngine,
};
pub use hedging::HedgingStat;
pub use manager::{Dispatch, ManagerBuildError, PolicyManager, PolicyNotFound};
pub use message::{try_fork, CopierError, ForkableMessage};
pub use observability::{
    Emitter, Logger, NoopEmitter, NoopLogger, ReportContext, Reporter, TracingEmitter,
    TracingLogger,
};
pub use policy::{
    ErrorCodeFn, ErrorPredicate, HedgingDelayFn, HedgingPolicy, HedgingPolicyBuilder,
    LogCondition, PolicyBuildError, ResponseValidator, RetryPolicy, RetryPolicyBuilder,
    SkipVisitedNodes,
};
pub use pushback::{Pushback, PUSHBACK_KEY};
pub use retry::{AttemptOutcome, Handler, RetryStat};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use sliding_window::SlidingWindowCounter;
pub use throttle::{NoopThrottle, Throttle, ThrottleBuildError, TokenBucketThrottle};

pub mod prelude;
