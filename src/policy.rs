//! Policy types: immutable-shape configuration for retry and hedging, with a handful of
//! runtime-swappable fields (backoff, predicates, validator, emitter, log sink) backed by
//! [`Adaptive`] so a long-lived policy can be retuned without restarting traffic.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::adaptive::Adaptive;
use crate::backoff::Backoff;
use crate::observability::{Emitter, Logger, NoopEmitter, NoopLogger};

const MAXIMUM_ATTEMPTS: usize = 5;

/// Maps a handler error to an integer error code, for code-set based classification. Downstream
/// error types that don't carry a code should return a sentinel (commonly `0` or `-1`) that
/// never appears in a configured code set.
pub type ErrorCodeFn<E> = Arc<dyn Fn(&E) -> i32 + Send + Sync>;

/// An additional predicate classifying an error as retryable/non-fatal, layered on top of the
/// code-set check.
pub type ErrorPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Maps a successful response to an optional error, letting a "successful" RPC be treated as
/// retryable based on its body (e.g. an application-level status field).
pub type ResponseValidator<Rsp, E> = Arc<dyn Fn(&Rsp) -> Option<E> + Send + Sync>;

/// Decides whether a finished invocation is interesting enough to flush its buffered log.
/// Takes the number of attempts made and whether the invocation ended in an error.
pub type LogCondition = Arc<dyn Fn(usize, bool) -> bool + Send + Sync>;

fn never_log(_attempts: usize, _errored: bool) -> bool {
    false
}

/// Classifies handler errors as retryable/non-fatal via a code set plus an optional predicate,
/// mirroring the source's `retryableECs map[int]struct{}` + `retryableErr func(error) bool`.
#[derive(Clone)]
pub struct Classifier<E> {
    codes: HashSet<i32>,
    code_fn: Option<ErrorCodeFn<E>>,
    predicate: Adaptive<Option<ErrorPredicate<E>>>,
}

impl<E> fmt::Debug for Classifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Classifier")
            .field("codes", &self.codes)
            .field("has_code_fn", &self.code_fn.is_some())
            .finish()
    }
}

impl<E> Classifier<E> {
    /// Build a classifier from a code set (evaluated via `code_fn`) and/or a predicate. At least
    /// one of the two must ultimately classify something, matching the source's validation
    /// ("one of retryableECs or retryableErr must be provided").
    pub fn new(
        codes: impl IntoIterator<Item = i32>,
        code_fn: Option<ErrorCodeFn<E>>,
        predicate: Option<ErrorPredicate<E>>,
    ) -> Self {
        Self {
            codes: codes.into_iter().collect(),
            code_fn,
            predicate: Adaptive::new(predicate),
        }
    }

    pub fn matches(&self, err: &E) -> bool {
        if let Some(code_fn) = &self.code_fn {
            if self.codes.contains(&code_fn(err)) {
                return true;
            }
        }
        self.predicate.get().as_ref().map(|p| p(err)).unwrap_or(false)
    }

    /// Atomically replace the predicate half of this classifier.
    pub fn set_predicate(&self, predicate: ErrorPredicate<E>) {
        self.predicate.set(Some(predicate));
    }
}

/// Tri-state mirroring the source's `*bool`: unset defers to the node-selection layer's default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SkipVisitedNodes {
    #[default]
    Unset,
    False,
    True,
}

/// Errors raised building a [`RetryPolicy`] or [`HedgingPolicy`].
#[derive(Debug, Clone)]
pub enum PolicyBuildError {
    /// `max_attempts` was not positive.
    NonPositiveMaxAttempts,
    /// No backoff strategy was supplied for a retry policy.
    MissingBackoff,
    /// No hedging delay was supplied for a hedging policy.
    MissingHedgingDelay,
    /// Neither an error-code set nor a predicate was supplied to classify errors.
    MissingClassifier,
}

impl fmt::Display for PolicyBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonPositiveMaxAttempts => write!(f, "max_attempts must be positive"),
            Self::MissingBackoff => write!(f, "backoff is uninitialized"),
            Self::MissingHedgingDelay => write!(f, "hedging_delay is uninitialized"),
            Self::MissingClassifier => {
                write!(f, "one of retryable error codes or a predicate must be provided")
            }
        }
    }
}

impl std::error::Error for PolicyBuildError {}

/// A hedging delay supplier: constant or dynamic, called once per spawned attempt.
pub type HedgingDelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

/// Immutable-shape retry configuration, generic over the handler's response and error types.
pub struct RetryPolicy<Rsp, E> {
    pub name: String,
    pub max_attempts: usize,
    pub backoff: Adaptive<Backoff>,
    pub classifier: Classifier<E>,
    pub response_validator: Adaptive<Option<ResponseValidator<Rsp, E>>>,
    pub skip_visited_nodes: SkipVisitedNodes,
    pub log_condition: Adaptive<LogCondition>,
    pub emitter: Adaptive<Arc<dyn Emitter>>,
    pub log_sink: Adaptive<Arc<dyn Logger>>,
}

impl<Rsp, E> fmt::Debug for RetryPolicy<Rsp, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Builder for [`RetryPolicy`], matching the source's functional-option `retry.New(...)`.
pub struct RetryPolicyBuilder<Rsp, E> {
    name: Option<String>,
    max_attempts: usize,
    backoff: Option<Backoff>,
    codes: Vec<i32>,
    code_fn: Option<ErrorCodeFn<E>>,
    predicate: Option<ErrorPredicate<E>>,
    response_validator: Option<ResponseValidator<Rsp, E>>,
    skip_visited_nodes: SkipVisitedNodes,
    log_condition: LogCondition,
    emitter: Arc<dyn Emitter>,
    log_sink: Arc<dyn Logger>,
}

impl<Rsp, E> RetryPolicyBuilder<Rsp, E> {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            name: None,
            max_attempts,
            backoff: None,
            codes: Vec::new(),
            code_fn: None,
            predicate: None,
            response_validator: None,
            skip_visited_nodes: SkipVisitedNodes::Unset,
            log_condition: Arc::new(never_log),
            emitter: Arc::new(NoopEmitter),
            log_sink: Arc::new(NoopLogger),
        }
    }

    pub fn log_condition(mut self, condition: LogCondition) -> Self {
        self.log_condition = condition;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn retryable_codes(mut self, codes: impl IntoIterator<Item = i32>, code_fn: ErrorCodeFn<E>) -> Self {
        self.codes.extend(codes);
        self.code_fn = Some(code_fn);
        self
    }

    pub fn retryable_predicate(mut self, predicate: ErrorPredicate<E>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn response_validator(mut self, validator: ResponseValidator<Rsp, E>) -> Self {
        self.response_validator = Some(validator);
        self
    }

    pub fn skip_visited_nodes(mut self, skip: bool) -> Self {
        self.skip_visited_nodes = if skip { SkipVisitedNodes::True } else { SkipVisitedNodes::False };
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn Logger>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn build(self) -> Result<RetryPolicy<Rsp, E>, PolicyBuildError> {
        if self.max_attempts == 0 {
            return Err(PolicyBuildError::NonPositiveMaxAttempts);
        }
        let max_attempts = self.max_attempts.min(MAXIMUM_ATTEMPTS);
        let backoff = self.backoff.ok_or(PolicyBuildError::MissingBackoff)?;
        if self.codes.is_empty() && self.predicate.is_none() {
            return Err(PolicyBuildError::MissingClassifier);
        }
        let classifier = Classifier::new(self.codes, self.code_fn, self.predicate);
        Ok(RetryPolicy {
            name: self.name.unwrap_or_else(|| format!("retry-{}", uuid::Uuid::new_v4())),
            max_attempts,
            backoff: Adaptive::new(backoff),
            classifier,
            response_validator: Adaptive::new(self.response_validator),
            skip_visited_nodes: self.skip_visited_nodes,
            log_condition: Adaptive::new(self.log_condition),
            emitter: Adaptive::new(self.emitter),
            log_sink: Adaptive::new(self.log_sink),
        })
    }
}

/// Immutable-shape hedging configuration.
pub struct HedgingPolicy<Rsp, E> {
    pub name: String,
    pub max_attempts: usize,
    pub hedging_delay: Adaptive<HedgingDelayFn>,
    pub non_fatal: Classifier<E>,
    pub response_validator: Adaptive<Option<ResponseValidator<Rsp, E>>>,
    pub skip_visited_nodes: SkipVisitedNodes,
    pub log_condition: Adaptive<LogCondition>,
    pub emitter: Adaptive<Arc<dyn Emitter>>,
    pub log_sink: Adaptive<Arc<dyn Logger>>,
}

impl<Rsp, E> fmt::Debug for HedgingPolicy<Rsp, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HedgingPolicy")
            .field("name", &self.name)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

/// Builder for [`HedgingPolicy`].
pub struct HedgingPolicyBuilder<Rsp, E> {
    name: Option<String>,
    max_attempts: usize,
    hedging_delay: Option<HedgingDelayFn>,
    codes: Vec<i32>,
    code_fn: Option<ErrorCodeFn<E>>,
    predicate: Option<ErrorPredicate<E>>,
    response_validator: Option<ResponseValidator<Rsp, E>>,
    skip_visited_nodes: SkipVisitedNodes,
    log_condition: LogCondition,
    emitter: Arc<dyn Emitter>,
    log_sink: Arc<dyn Logger>,
}

impl<Rsp, E> HedgingPolicyBuilder<Rsp, E> {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            name: None,
            max_attempts,
            hedging_delay: None,
            codes: Vec::new(),
            code_fn: None,
            predicate: None,
            response_validator: None,
            skip_visited_nodes: SkipVisitedNodes::Unset,
            log_condition: Arc::new(never_log),
            emitter: Arc::new(NoopEmitter),
            log_sink: Arc::new(NoopLogger),
        }
    }

    pub fn log_condition(mut self, condition: LogCondition) -> Self {
        self.log_condition = condition;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn static_delay(mut self, delay: Duration) -> Self {
        self.hedging_delay = Some(Arc::new(move |_attempt| delay));
        self
    }

    pub fn dynamic_delay(mut self, f: HedgingDelayFn) -> Self {
        self.hedging_delay = Some(f);
        self
    }

    pub fn non_fatal_codes(mut self, codes: impl IntoIterator<Item = i32>, code_fn: ErrorCodeFn<E>) -> Self {
        self.codes.extend(codes);
        self.code_fn = Some(code_fn);
        self
    }

    pub fn non_fatal_predicate(mut self, predicate: ErrorPredicate<E>) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn response_validator(mut self, validator: ResponseValidator<Rsp, E>) -> Self {
        self.response_validator = Some(validator);
        self
    }

    pub fn skip_visited_nodes(mut self, skip: bool) -> Self {
        self.skip_visited_nodes = if skip { SkipVisitedNodes::True } else { SkipVisitedNodes::False };
        self
    }

    pub fn emitter(mut self, emitter: Arc<dyn Emitter>) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn log_sink(mut self, sink: Arc<dyn Logger>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn build(self) -> Result<HedgingPolicy<Rsp, E>, PolicyBuildError> {
        if self.max_attempts == 0 {
            return Err(PolicyBuildError::NonPositiveMaxAttempts);
        }
        let max_attempts = self.max_attempts.min(MAXIMUM_ATTEMPTS);
        let hedging_delay = self.hedging_delay.ok_or(PolicyBuildError::MissingHedgingDelay)?;
        if self.codes.is_empty() && self.predicate.is_none() {
            return Err(PolicyBuildError::MissingClassifier);
        }
        let non_fatal = Classifier::new(self.codes, self.code_fn, self.predicate);
        Ok(HedgingPolicy {
            name: self.name.unwrap_or_else(|| format!("hedging-{}", uuid::Uuid::new_v4())),
            max_attempts,
            hedging_delay: Adaptive::new(hedging_delay),
            non_fatal,
            response_validator: Adaptive::new(self.response_validator),
            skip_visited_nodes: self.skip_visited_nodes,
            log_condition: Adaptive::new(self.log_condition),
            emitter: Adaptive::new(self.emitter),
            log_sink: Adaptive::new(self.log_sink),
        })
    }
}
