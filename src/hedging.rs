//! Concurrent hedging executor.
//!
//! Unlike [`crate::retry`], attempts overlap: a new one is spawned on a timer tick regardless of
//! whether earlier attempts have returned, and the first attempt to return a usable result wins.
//! Every attempt still running when a winner is chosen is aborted via its `JoinHandle` — see the
//! note on [`invoke`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cancellation::{self, Cancellation};
use crate::error::EngineError;
use crate::message::{try_commit_back, try_fork, ForkableMessage};
use crate::observability::{Attempt as ObsAttempt, LazyLog, Reporter, ReportContext, Stat as ObsStat};
use crate::policy::HedgingPolicy;
use crate::pushback::{self, Pushback};
use crate::retry::AttemptOutcome;
use crate::sleeper::Sleeper;
use crate::sliding_window::SlidingWindowCounter;
use crate::throttle::Throttle;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A handler invoked once per spawned attempt with a freshly forked request.
pub type Handler<Req, Rsp, E> =
    Arc<dyn Fn(Req) -> BoxFuture<'static, AttemptOutcome<Rsp, E>> + Send + Sync>;

/// One completed attempt, kept for reporting.
pub struct HedgingAttempt<E> {
    pub index: usize,
    pub start: Instant,
    pub end: Instant,
    pub error: Option<E>,
    pub pushback: Option<Pushback>,
}

impl<E> ObsAttempt for HedgingAttempt<E> {
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

/// A snapshot of a finished hedging invocation.
pub struct HedgingStat<E> {
    pub cost: Duration,
    pub attempts: Vec<HedgingAttempt<E>>,
    pub throttled: bool,
    pub inflight_n: usize,
    pub errored: bool,
}

impl<E> ObsStat for HedgingStat<E> {
    type Attempt = HedgingAttempt<E>;
    fn cost(&self) -> Duration {
        self.cost
    }
    fn attempts(&self) -> &[HedgingAttempt<E>] {
        &self.attempts
    }
    fn throttled(&self) -> bool {
        self.throttled
    }
    fn inflight_n(&self) -> usize {
        self.inflight_n
    }
    fn error_code(&self) -> i32 {
        if self.errored {
            1
        } else {
            0
        }
    }
}

struct Finished<Rsp, E> {
    index: usize,
    start: Instant,
    end: Instant,
    result: Result<Rsp, E>,
    pushback: Option<Pushback>,
}

/// Run `req` through `handler`, spawning overlapping attempts per `policy.hedging_delay` until
/// one returns a usable result, every attempt slot is exhausted, or the throttle vetoes further
/// attempts.
///
/// Every attempt still running when the loop exits (a winner chosen, exhaustion, or
/// cancellation) is aborted via its `JoinHandle` — it is not merely detached. `req` is committed
/// to: the forked copy behind the attempt that ends the loop is copied back into it via
/// [`ForkableMessage::commit_back`].
///
/// `cancellation` is observed alongside both the spawn-timer and the results channel; it fires
/// `EngineError::Cancelled`/`EngineError::Timeout` and aborts every still-inflight attempt just
/// like a normal exit.
pub async fn invoke<Req, Rsp, E>(
    policy: &HedgingPolicy<Rsp, E>,
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
    let mut attempts: Vec<HedgingAttempt<E>> = Vec::new();
    let mut failures: Vec<E> = Vec::new();
    let mut throttled = false;
    let mut frozen = false;
    let mut inflight_n: usize = 0;
    let log_sink = policy.log_sink.get();
    let mut lazy = LazyLog::new(&**log_sink);

    let req_ref: &Req = req;
    let mut inflight_handles: HashMap<usize, JoinHandle<()>> = HashMap::new();
    let mut committable: HashMap<usize, Req> = HashMap::new();

    let (tx, mut rx) = mpsc::unbounded_channel::<Finished<Rsp, E>>();

    let mut spawn_attempt = |attempts_len: usize,
                             tx: mpsc::UnboundedSender<Finished<Rsp, E>>,
                             committable: &mut HashMap<usize, Req>|
     -> Result<JoinHandle<()>, EngineError<E>> {
        let forked = try_fork(req_ref).map_err(|e| EngineError::Internal(e.to_string()))?;
        let kept = try_fork(&forked).map_err(|e| EngineError::Internal(e.to_string()))?;
        let index = attempts_len + 1;
        committable.insert(index, kept);
        window.record();
        let handler = handler.clone();
        let attempt_start = Instant::now();
        Ok(tokio::spawn(async move {
            let AttemptOutcome { result, metadata } = handler(forked).await;
            let pushback = pushback::from_metadata(&metadata);
            let _ = tx.send(Finished { index, start: attempt_start, end: Instant::now(), result, pushback });
        }))
    };

    let first_handle = match spawn_attempt(attempts.len(), tx.clone(), &mut committable) {
        Ok(h) => h,
        Err(e) => return Err(e),
    };
    inflight_handles.insert(1, first_handle);
    inflight_n += 1;
    if attempts.len() + 1 == policy.max_attempts {
        lazy.printf("freeze hedging for no more attempts");
        frozen = true;
    }
    attempts.push(placeholder_attempt(1));

    let mut delay = (policy.hedging_delay.get())(1);

    let outcome = loop {
        if frozen {
            if inflight_n == 0 {
                break Err(EngineError::RetryableExhausted {
                    attempts: attempts.len(),
                    failures: EngineError::<E>::cap_failures(std::mem::take(&mut failures)),
                });
            }
            tokio::select! {
                reason = cancellation.done() => {
                    break Err(cancellation::as_engine_error(reason, start.elapsed(), attempts.len()));
                }
                finished = rx.recv() => {
                    let finished = match finished {
                        Some(f) => f,
                        None => break Err(EngineError::Internal("hedging results channel closed".into())),
                    };
                    inflight_handles.remove(&finished.index);
                    let finished_index = finished.index;
                    if let Some(outcome) = handle_finished(
                        policy,
                        throttle,
                        &mut attempts,
                        &mut failures,
                        &mut inflight_n,
                        &mut frozen,
                        &mut delay,
                        &mut lazy,
                        finished,
                    ) {
                        if let Some(c) = committable.remove(&finished_index) {
                            if let Err(e) = try_commit_back(req, &c) {
                                break Err(EngineError::Internal(e.to_string()));
                            }
                        }
                        break outcome;
                    }
                }
            }
            continue;
        }

        tokio::select! {
            reason = cancellation.done() => {
                break Err(cancellation::as_engine_error(reason, start.elapsed(), attempts.len()));
            }
            _ = sleeper.sleep(delay) => {
                if !throttle.allow() {
                    throttled = true;
                    frozen = true;
                    lazy.printf("freeze hedging for throttle");
                    continue;
                }
                let handle = match spawn_attempt(attempts.len(), tx.clone(), &mut committable) {
                    Ok(h) => h,
                    Err(e) => break Err(e),
                };
                let index = attempts.len() + 1;
                inflight_handles.insert(index, handle);
                inflight_n += 1;
                attempts.push(placeholder_attempt(index));
                if index == policy.max_attempts {
                    lazy.printf("freeze hedging for no more attempts");
                    frozen = true;
                } else {
                    delay = (policy.hedging_delay.get())(index + 1);
                }
            }
            finished = rx.recv() => {
                let finished = match finished {
                    Some(f) => f,
                    None => break Err(EngineError::Internal("hedging results channel closed".into())),
                };
                inflight_handles.remove(&finished.index);
                let finished_index = finished.index;
                if let Some(outcome) = handle_finished(
                    policy,
                    throttle,
                    &mut attempts,
                    &mut failures,
                    &mut inflight_n,
                    &mut frozen,
                    &mut delay,
                    &mut lazy,
                    finished,
                ) {
                    if let Some(c) = committable.remove(&finished_index) {
                        if let Err(e) = try_commit_back(req, &c) {
                            break Err(EngineError::Internal(e.to_string()));
                        }
                    }
                    break outcome;
                }
            }
        }
    };

    for (_, handle) in inflight_handles.into_iter() {
        handle.abort();
    }

    let cost = start.elapsed();
    let errored = outcome.is_err();
    let stat = HedgingStat { cost, attempts, throttled, inflight_n, errored };
    let log_condition = policy.log_condition.get();
    if log_condition(stat.attempts.len(), errored) {
        lazy.flush();
    }
    let emitter: Arc<dyn crate::observability::Emitter> = (*policy.emitter.get()).clone();
    let reporter = Reporter::new(emitter);
    reporter.report(&ctx, &stat, window.count());

    outcome
}

fn placeholder_attempt<E>(index: usize) -> HedgingAttempt<E> {
    let now = Instant::now();
    HedgingAttempt { index, start: now, end: now, error: None, pushback: None }
}

/// Process one returned attempt, mirroring the source's `onReturn`: returns `Some(outcome)` when
/// the invocation should terminate, `None` to keep waiting.
fn handle_finished<Rsp, E>(
    policy: &HedgingPolicy<Rsp, E>,
    throttle: &dyn Throttle,
    attempts: &mut [HedgingAttempt<E>],
    failures: &mut Vec<E>,
    inflight_n: &mut usize,
    frozen: &mut bool,
    delay: &mut Duration,
    lazy: &mut LazyLog<'_>,
    finished: Finished<Rsp, E>,
) -> Option<Result<Rsp, EngineError<E>>>
where
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    *inflight_n -= 1;
    lazy.printf(format!("{}th attempt has returned, current inflightN: {}", finished.index, inflight_n));

    let no_hedging = matches!(finished.pushback, Some(Pushback::NoMoreAttempts));
    let is_ok = finished.result.is_ok();
    let fatal = match &finished.result {
        Ok(_) => false,
        Err(e) => !policy.non_fatal.matches(e),
    };
    ack_throttle(throttle, is_ok, fatal, no_hedging);

    if let Some(slot) = attempts.get_mut(finished.index - 1) {
        slot.start = finished.start;
        slot.end = finished.end;
        slot.pushback = finished.pushback.clone();
        if let Err(e) = &finished.result {
            slot.error = Some(e.clone());
        }
    }

    match finished.result {
        Ok(rsp) => {
            lazy.printf(format!("{}th attempt is returned to client", finished.index));
            Some(Ok(rsp))
        }
        Err(e) => {
            if fatal {
                lazy.printf(format!("{}th attempt failed with fatal error", finished.index));
                return Some(Err(EngineError::Fatal(e)));
            }
            failures.push(e);

            // Mirror the source's unconditional scheduleNext() after a non-final return: a
            // fresh attempt is due immediately unless the server told us to stop, or a
            // pushback asked for a specific delay before the next one.
            match finished.pushback {
                Some(Pushback::NoMoreAttempts) => *frozen = true,
                Some(Pushback::Delay(d)) if !*frozen => *delay = d,
                _ if !*frozen => *delay = Duration::ZERO,
                _ => {}
            }

            if *frozen && *inflight_n == 0 {
                Some(Err(EngineError::RetryableExhausted {
                    attempts: attempts.len(),
                    failures: EngineError::<E>::cap_failures(std::mem::take(failures)),
                }))
            } else {
                None
            }
        }
    }
}

fn ack_throttle(throttle: &dyn Throttle, ok: bool, fatal: bool, no_hedging: bool) {
    if !no_hedging {
        if ok {
            throttle.on_success();
            return;
        }
        if fatal {
            return;
        }
    }
    throttle.on_failure();
}
