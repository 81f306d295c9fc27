//! Convenient re-exports for common Nine Lives types.
pub use crate::{
    is_disabled, try_fork, with_disabled, Adaptive, AttemptOutcome, Backoff, BackoffBuildError,
    BackoffCfg, Cancellation, ClientFilter, ConfigError, CopierError, Dispatch, DoneReason, Emitter, EngineConfig,
    EngineError, ErrorCodeFn, ErrorPredicate, ExponentialBackoffCfg, FilterContext, FilterLayer,
    FilterRequest, FilterService, ForkableMessage, Handler, HedgingCfg, HedgingDelayFn,
    HedgingPolicy, HedgingPolicyBuilder, HedgingStat, HumanDuration, InstantSleeper, LogCondition,
    Logger, ManagerBuildError, MethodCfg, NoopEmitter, NoopLogger, NoopThrottle, PolicyBuildError,
    PolicyManager, PolicyNotFound, Pushback, ReportContext, Reporter, ResponseValidator, RetryCfg,
    RetryHedgingCfg, RetryHedgingEngine, RetryPolicy, RetryPolicyBuilder, RetryStat, ServiceCfg,
    SkipVisitedNodes, Sleeper, SlidingWindowCounter, Throttle, ThrottleBuildError, ThrottleCfg,
    TokenBucketThrottle, TokioSleeper, TracingEmitter, TracingLogger, TrackingSleeper,
    MAX_BACKOFF, MAX_RETRY_FAILURES, PUSHBACK_KEY,
};
