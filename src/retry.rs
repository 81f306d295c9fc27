//! Sequential retry executor.
//!
//! Each attempt runs to completion before the next is scheduled; classification, server
//! pushback, and throttle feedback all happen between attempts rather than concurrently, which
//! is what separates this from [`crate::hedging`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cancellation::{self, Cancellation};
use crate::error::EngineError;
use crate::message::{try_commit_back, try_fork, ForkableMessage};
use crate::observability::{Attempt as ObsAttempt, LazyLog, Reporter, ReportContext, Stat as ObsStat};
use crate::policy::RetryPolicy;
use crate::pushback::{self, Pushback};
use crate::sleeper::Sleeper;
use crate::sliding_window::SlidingWindowCounter;
use crate::throttle::Throttle;

/// The outcome of a single attempt: either a response or an error, plus any response metadata
/// (used to extract server pushback).
pub struct AttemptOutcome<Rsp, E> {
    pub result: Result<Rsp, E>,
    pub metadata: HashMap<String, String>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler invoked once per attempt with a freshly forked request.
pub type Handler<Req, Rsp, E> =
    Arc<dyn Fn(Req) -> BoxFuture<'static, AttemptOutcome<Rsp, E>> + Send + Sync>;

/// One completed attempt, kept for reporting.
pub struct RetryAttempt<E> {
    pub index: usize,
    pub start: Instant,
    pub end: Instant,
    pub error: Option<E>,
    pub pushback: Option<Pushback>,
}

impl<E> ObsAttempt for RetryAttempt<E> {
    fn start(&self) -> Instant {
        self.start
    }
    fn end(&self) -> Option<Instant> {
        Some(self.end)
    }
    fn error_code(&self) -> i32 {
        if self.error.is_some() {
            1
        } else {
            0
        }
    }
    fn inflight(&self) -> bool {
        false
    }
    fn no_more_attempt(&self) -> bool {
        matches!(self.pushback, Some(Pushback::NoMoreAttempts))
    }
}

/// A snapshot of a finished retry invocation, reportable via [`crate::observability::Reporter`].
pub struct RetryStat<E> {
    pub cost: Duration,
    pub attempts: Vec<RetryAttempt<E>>,
    pub throttled: bool,
    pub errored: bool,
}

impl<E> ObsStat for RetryStat<E> {
    type Attempt = RetryAttempt<E>;
    fn cost(&self) -> Duration {
        self.cost
    }
    fn attempts(&self) -> &[RetryAttempt<E>] {
        &self.attempts
    }
    fn throttled(&self) -> bool {
        self.throttled
    }
    fn inflight_n(&self) -> usize {
        0
    }
    fn error_code(&self) -> i32 {
        if self.errored {
            1
        } else {
            0
        }
    }
}

/// Run `req` through `handler`, retrying sequentially per `policy` until a non-retryable
/// outcome, retry exhaustion, or a "no more attempts" pushback/classification.
///
/// `req` is committed to: the forked copy that produced the attempt the loop exits on (success,
/// fatal error, or exhaustion) is copied back into it via [`ForkableMessage::commit_back`], so the
/// caller observes whatever that winning attempt did to its own request state.
///
/// `cancellation` is observed at every suspension point (the backoff sleep and the handler call
/// itself); the loop exits immediately with `EngineError::Cancelled`/`EngineError::Timeout` if it
/// fires first.
pub async fn invoke<Req, Rsp, E>(
    policy: &RetryPolicy<Rsp, E>,
    throttle: &dyn Throttle,
    window: &SlidingWindowCounter,
    sleeper: &dyn Sleeper,
    req: &mut Req,
    handler: Handler<Req, Rsp, E>,
    ctx: ReportContext,
    cancellation: &Cancellation,
) -> Result<Rsp, EngineError<E>>
where
    Req: ForkableMessage,
    Rsp: Send + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    let start = Instant::now();
    let mut attempts: Vec<RetryAttempt<E>> = Vec::new();
    let mut failures: Vec<E> = Vec::new();
    let mut throttled = false;
    let mut delay = Duration::ZERO;
    let log_sink = policy.log_sink.get();
    let mut lazy = LazyLog::new(&**log_sink);

    let outcome = loop {
        if !delay.is_zero() {
            tokio::select! {
                _ = sleeper.sleep(delay) => {}
                reason = cancellation.done() => {
                    break Err(cancellation::as_engine_error(reason, start.elapsed(), attempts.len()));
                }
            }
        }

        let index = attempts.len() + 1;
        let mut frozen = index == policy.max_attempts;
        if !frozen && !throttle.allow() {
            frozen = true;
            throttled = true;
            lazy.printf("freeze retry for throttle");
        } else if index == policy.max_attempts {
            lazy.printf("freeze retry for no more attempts");
        }

        let forked = match try_fork(req) {
            Ok(f) => f,
            Err(e) => {
                lazy.printf(format!("message fork failed: {}", e));
                lazy.flush();
                return Err(EngineError::Internal(e.to_string()));
            }
        };
        let committable = match try_fork(&forked) {
            Ok(c) => c,
            Err(e) => {
                lazy.printf(format!("message fork failed: {}", e));
                lazy.flush();
                return Err(EngineError::Internal(e.to_string()));
            }
        };

        window.record();
        lazy.printf(format!("start {}th attempt", index));
        let attempt_start = Instant::now();
        let AttemptOutcome { result, metadata } = tokio::select! {
            outcome = handler(forked) => outcome,
            reason = cancellation.done() => {
                break Err(cancellation::as_engine_error(reason, start.elapsed(), attempts.len()));
            }
        };
        let attempt_end = Instant::now();
        let pushback = pushback::from_metadata(&metadata);
        let no_more = matches!(pushback, Some(Pushback::NoMoreAttempts));

        let retryable = match &result {
            Ok(_) => false,
            Err(e) => policy.classifier.matches(e),
        };

        if no_more || !retryable {
            if result.is_ok() {
                throttle.on_success();
            } else {
                throttle.on_failure();
            }
        } else {
            throttle.on_failure();
        }

        let err_for_record = result.as_ref().err().cloned();
        attempts.push(RetryAttempt {
            index,
            start: attempt_start,
            end: attempt_end,
            error: err_for_record,
            pushback,
        });

        match result {
            Ok(rsp) => {
                let response_validator = policy.response_validator.get();
                if let Some(validator) = response_validator.as_ref() {
                    if let Some(err) = validator(&rsp) {
                        if !policy.classifier.matches(&err) || no_more || frozen {
                            if let Err(e) = try_commit_back(req, &committable) {
                                break Err(EngineError::Internal(e.to_string()));
                            }
                            break Err(EngineError::Fatal(err));
                        }
                        failures.push(err);
                        lazy.printf(format!("{}th attempt has returned", index));
                        match schedule_next(pushback, policy, index, &mut delay) {
                            ScheduleOutcome::Frozen => {
                                if let Err(e) = try_commit_back(req, &committable) {
                                    break Err(EngineError::Internal(e.to_string()));
                                }
                                break Err(EngineError::RetryableExhausted {
                                    attempts: attempts.len(),
                                    failures: EngineError::<E>::cap_failures(failures),
                                })
                            }
                            ScheduleOutcome::Scheduled => continue,
                        }
                    }
                }
                lazy.printf(format!("{}th attempt is returned to caller", index));
                if let Err(e) = try_commit_back(req, &committable) {
                    break Err(EngineError::Internal(e.to_string()));
                }
                break Ok(rsp);
            }
            Err(e) => {
                if !retryable {
                    lazy.printf(format!("{}th attempt failed with non-retryable error", index));
                    if let Err(copier_err) = try_commit_back(req, &committable) {
                        break Err(EngineError::Internal(copier_err.to_string()));
                    }
                    break Err(EngineError::Fatal(e));
                }
                failures.push(e);
                if no_more || frozen {
                    lazy.printf("retry exhausted");
                    if let Err(copier_err) = try_commit_back(req, &committable) {
                        break Err(EngineError::Internal(copier_err.to_string()));
                    }
                    break Err(EngineError::RetryableExhausted {
                        attempts: attempts.len(),
                        failures: EngineError::<E>::cap_failures(failures),
                    });
                }
                match schedule_next(pushback, policy, index, &mut delay) {
                    ScheduleOutcome::Frozen => {
                        if let Err(copier_err) = try_commit_back(req, &committable) {
                            break Err(EngineError::Internal(copier_err.to_string()));
                        }
                        break Err(EngineError::RetryableExhausted {
                            attempts: attempts.len(),
                            failures: EngineError::<E>::cap_failures(failures),
                        })
                    }
                    ScheduleOutcome::Scheduled => continue,
                }
            }
        }
    };

    let cost = start.elapsed();
    let errored = outcome.is_err();
    let stat = RetryStat { cost, attempts, throttled, errored };
    let log_condition = policy.log_condition.get();
    if log_condition(stat.attempts.len(), errored) {
        lazy.flush();
    }
    let emitter: Arc<dyn crate::observability::Emitter> = (*policy.emitter.get()).clone();
    let reporter = Reporter::new(emitter);
    reporter.report(&ctx, &stat, window.count());

    outcome
}

enum ScheduleOutcome {
    Scheduled,
    Frozen,
}

fn schedule_next<Rsp, E>(
    pushback: Option<Pushback>,
    policy: &RetryPolicy<Rsp, E>,
    attempt_index: usize,
    delay: &mut Duration,
) -> ScheduleOutcome {
    match pushback {
        Some(Pushback::NoMoreAttempts) => ScheduleOutcome::Frozen,
        Some(Pushback::Delay(d)) => {
            *delay = d;
            ScheduleOutcome::Scheduled
        }
        Some(Pushback::Immediate) => {
            *delay = Duration::ZERO;
            ScheduleOutcome::Scheduled
        }
        None => {
            *delay = policy.backoff.get().delay(attempt_index);
            ScheduleOutcome::Scheduled
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::cancellation::Cancellation;
    use crate::observability::NoopEmitter;
    use crate::policy::RetryPolicyBuilder;
    use crate::sleeper::InstantSleeper;
    use crate::throttle::NoopThrottle;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn window() -> SlidingWindowCounter {
        SlidingWindowCounter::new(Duration::from_secs(10))
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for TestError {}

    #[derive(Clone)]
    struct Req(u32);

    impl ForkableMessage for Req {
        fn fork(&self) -> Self {
            Req(self.0)
        }
        fn commit_back(&mut self, winner: &Self) {
            self.0 = winner.0;
        }
    }

    fn code_of(_e: &TestError) -> i32 {
        1
    }

    fn policy(max_attempts: usize) -> RetryPolicy<u32, TestError> {
        RetryPolicyBuilder::new(max_attempts)
            .backoff(Backoff::linear(vec![Duration::from_millis(1)]).unwrap())
            .retryable_codes([1], Arc::new(code_of))
            .emitter(Arc::new(NoopEmitter))
            .build()
            .unwrap()
    }

    fn boxed<F, Fut>(f: F) -> Handler<Req, u32, TestError>
    where
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AttemptOutcome<u32, TestError>> + Send + 'static,
    {
        Arc::new(move |req| Box::pin(f(req)))
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_retrying() {
        let policy = policy(3);
        let throttle = NoopThrottle;
        let sleeper = InstantSleeper;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handler = boxed(move |_req| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async { AttemptOutcome { result: Ok(42u32), metadata: HashMap::new() } }
        });

        let result = invoke(
            &policy,
            &throttle,
            &window(),
            &sleeper,
            &mut Req(0),
            handler,
            ReportContext::default(),
            &Cancellation::new(),
        )
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_error_until_success() {
        let policy = policy(3);
        let throttle = NoopThrottle;
        let sleeper = InstantSleeper;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handler = boxed(move |_req| {
            let attempt = calls2.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 1 {
                    AttemptOutcome {
                        result: Err(TestError("retryable")),
                        metadata: HashMap::new(),
                    }
                } else {
                    AttemptOutcome { result: Ok(7u32), metadata: HashMap::new() }
                }
            }
        });

        let result = invoke(
            &policy,
            &throttle,
            &window(),
            &sleeper,
            &mut Req(0),
            handler,
            ReportContext::default(),
            &Cancellation::new(),
        )
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let policy = policy(2);
        let throttle = NoopThrottle;
        let sleeper = InstantSleeper;
        let handler = boxed(|_req| async {
            AttemptOutcome {
                result: Err(TestError("always fails")),
                metadata: HashMap::new(),
            }
        });

        let err = invoke(
            &policy,
            &throttle,
            &window(),
            &sleeper,
            &mut Req(0),
            handler,
            ReportContext::default(),
            &Cancellation::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable_exhausted());
    }

    #[tokio::test]
    async fn no_more_attempts_pushback_stops_retrying_early() {
        let policy = policy(5);
        let throttle = NoopThrottle;
        let sleeper = InstantSleeper;
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handler = boxed(move |_req| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async {
                let mut metadata = HashMap::new();
                metadata.insert(pushback::PUSHBACK_KEY.to_string(), "-1s".to_string());
                AttemptOutcome {
                    result: Err(TestError("retryable")),
                    metadata,
                }
            }
        });

        let err = invoke(
            &policy,
            &throttle,
            &window(),
            &sleeper,
            &mut Req(0),
            handler,
            ReportContext::default(),
            &Cancellation::new(),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_aborts_a_slow_attempt_with_cancelled_error() {
        let policy = policy(3);
        let throttle = NoopThrottle;
        let sleeper = InstantSleeper;
        let cancellation = Cancellation::new();
        cancellation.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let handler = boxed(move |_req| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                AttemptOutcome { result: Ok(1u32), metadata: HashMap::new() }
            }
        });

        let err = invoke(
            &policy,
            &throttle,
            &window(),
            &sleeper,
            &mut Req(0),
            handler,
            ReportContext::default(),
            &cancellation,
        )
        .await
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn elapsed_deadline_stops_retrying_with_timeout_error() {
        let policy = policy(3);
        let throttle = NoopThrottle;
        let sleeper = InstantSleeper;
        let cancellation = Cancellation::with_deadline(std::time::Instant::now());
        let handler = boxed(move |_req| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            AttemptOutcome { result: Ok(1u32), metadata: HashMap::new() }
        });

        let err = invoke(
            &policy,
            &throttle,
            &window(),
            &sleeper,
            &mut Req(0),
            handler,
            ReportContext::default(),
            &cancellation,
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }
}
