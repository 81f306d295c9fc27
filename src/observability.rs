//! Lazy per-request logging and metrics reporting for retry/hedging attempts.
//!
//! Mirrors the source's `view` package: a snapshot of a finished invocation (`Stat`, made up of
//! per-attempt `Attempt` snapshots) is fed into a `Reporter`, which breaks it into tagged
//! counter/histogram emissions; a `LazyLog` buffers per-attempt trace lines so a verbose
//! invocation logs as one flush instead of one line per attempt.

use std::time::{Duration, Instant};

/// Fully-qualified metric names, matching the source's `FQN*` constants.
pub mod fqn {
    pub const APP_REQUEST: &str = "appRequest";
    pub const REAL_REQUEST: &str = "realRequest";
    pub const APP_COST_MS: &str = "appCostMs";
    pub const REAL_COST_MS: &str = "realCostMs";
    /// Approximate attempts-per-window rate, fed by a [`crate::sliding_window::SlidingWindowCounter`]
    /// shared across every invocation of a given `(service, method)` pair.
    pub const ATTEMPT_RATE: &str = "attemptRateWindow";
}

/// Metric tag keys, matching the source's `Tag*` constants.
pub mod tag {
    pub const CALLER: &str = "caller";
    pub const CALLEE: &str = "callee";
    pub const METHOD: &str = "method";
    pub const ATTEMPTS: &str = "attempts";
    pub const ERR_CODES: &str = "error_codes";
    pub const THROTTLED: &str = "throttled";
    pub const INFLIGHT: &str = "inflight";
    pub const NO_MORE_ATTEMPT: &str = "noMoreAttempt";
}

/// A snapshot of one attempt, for reporting purposes.
pub trait Attempt {
    fn start(&self) -> Instant;
    fn end(&self) -> Option<Instant>;
    fn error_code(&self) -> i32;
    fn inflight(&self) -> bool;
    fn no_more_attempt(&self) -> bool;
}

/// A snapshot of a finished (or in-flight) invocation, for reporting purposes.
pub trait Stat {
    type Attempt: Attempt;

    fn cost(&self) -> Duration;
    fn attempts(&self) -> &[Self::Attempt];
    fn throttled(&self) -> bool;
    fn inflight_n(&self) -> usize;
    fn error_code(&self) -> i32;
}

/// Context identifying the caller/callee/method of the invocation being reported, used to tag
/// every emitted metric.
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub caller: String,
    pub callee: String,
    pub method: String,
}

impl ReportContext {
    fn tags(&self) -> Vec<(&'static str, String)> {
        vec![
            (tag::CALLER, non_empty_or_unknown(&self.caller)),
            (tag::CALLEE, non_empty_or_unknown(&self.callee)),
            (tag::METHOD, non_empty_or_unknown(&self.method)),
        ]
    }
}

fn non_empty_or_unknown(s: &str) -> String {
    if s.is_empty() {
        "unknown".to_string()
    } else {
        s.to_string()
    }
}

/// A metric counter sink.
pub trait Counter: Send + Sync {
    fn inc(&self, name: &str, count: i64, tags: &[(&str, String)]);
}

/// A metric histogram sink.
pub trait Histogram: Send + Sync {
    fn observe(&self, name: &str, value: f64, tags: &[(&str, String)]);
}

/// A combined counter + histogram sink.
pub trait Emitter: Counter + Histogram {}
impl<T: Counter + Histogram> Emitter for T {}

impl Counter for std::sync::Arc<dyn Emitter> {
    fn inc(&self, name: &str, count: i64, tags: &[(&str, String)]) {
        self.as_ref().inc(name, count, tags)
    }
}

impl Histogram for std::sync::Arc<dyn Emitter> {
    fn observe(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        self.as_ref().observe(name, value, tags)
    }
}

/// An emitter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEmitter;

impl Counter for NoopEmitter {
    fn inc(&self, _name: &str, _count: i64, _tags: &[(&str, String)]) {}
}

impl Histogram for NoopEmitter {
    fn observe(&self, _name: &str, _value: f64, _tags: &[(&str, String)]) {}
}

/// An emitter that logs each emission at debug level via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEmitter;

impl Counter for TracingEmitter {
    fn inc(&self, name: &str, count: i64, tags: &[(&str, String)]) {
        tracing::debug!(metric = name, count, ?tags, "counter");
    }
}

impl Histogram for TracingEmitter {
    fn observe(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        tracing::debug!(metric = name, value, ?tags, "histogram");
    }
}

/// Breaks a [`Stat`] into the four `appRequest`/`realRequest`/`appCostMs`/`realCostMs` metrics,
/// one `realRequest`/`realCostMs` pair per attempt plus a single `appRequest`/`appCostMs` pair
/// for the whole invocation.
pub struct Reporter<E: Emitter> {
    emitter: E,
    base_tags: Vec<(&'static str, String)>,
}

impl<E: Emitter> Reporter<E> {
    pub fn new(emitter: E) -> Self {
        Self { emitter, base_tags: Vec::new() }
    }

    /// `attempt_rate` is the caller's recent attempts-per-window count (see
    /// [`crate::sliding_window::SlidingWindowCounter`]), reported once per invocation as a gauge
    /// alongside the usual request/cost pairs.
    pub fn report<S: Stat>(&self, ctx: &ReportContext, stat: &S, attempt_rate: f64) {
        let base = ctx.tags();

        let mut no_more_attempt = false;
        for attempt in stat.attempts() {
            if attempt.no_more_attempt() {
                no_more_attempt = true;
            }
            let mut real_tags = base.clone();
            real_tags.extend(self.base_tags.clone());
            real_tags.push((tag::ERR_CODES, attempt.error_code().to_string()));
            real_tags.push((tag::INFLIGHT, attempt.inflight().to_string()));
            real_tags.push((tag::NO_MORE_ATTEMPT, attempt.no_more_attempt().to_string()));

            self.emitter.inc(fqn::REAL_REQUEST, 1, &real_tags);

            let end = attempt.end().unwrap_or_else(Instant::now);
            let cost = end.saturating_duration_since(attempt.start());
            self.emitter.observe(fqn::REAL_COST_MS, milliseconds(cost), &real_tags);
        }

        let mut app_tags = base;
        app_tags.extend(self.base_tags.clone());
        app_tags.push((tag::ATTEMPTS, stat.attempts().len().to_string()));
        app_tags.push((tag::ERR_CODES, stat.error_code().to_string()));
        app_tags.push((tag::THROTTLED, stat.throttled().to_string()));
        app_tags.push((tag::INFLIGHT, stat.inflight_n().to_string()));
        app_tags.push((tag::NO_MORE_ATTEMPT, no_more_attempt.to_string()));

        self.emitter.inc(fqn::APP_REQUEST, 1, &app_tags);
        self.emitter.observe(fqn::APP_COST_MS, milliseconds(stat.cost()), &app_tags);
        self.emitter.observe(fqn::ATTEMPT_RATE, attempt_rate, &app_tags);
    }
}

fn milliseconds(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

/// A log sink accepting a single, already-joined message.
pub trait Logger: Send + Sync {
    fn println(&self, message: &str);
}

/// Buffers per-attempt log lines and flushes them as one joined message, so a noisy invocation
/// produces a single log call instead of one per attempt.
///
/// Not concurrent-safe; each in-flight invocation owns its own `LazyLog`.
pub struct LazyLog<'a> {
    log: &'a dyn Logger,
    buf: Vec<String>,
}

impl<'a> LazyLog<'a> {
    pub fn new(log: &'a dyn Logger) -> Self {
        Self { log, buf: vec!["[lazy log]".to_string()] }
    }

    /// Append a formatted line, timestamped to millisecond precision.
    pub fn printf(&mut self, message: impl Into<String>) {
        let now = chrono_like_timestamp();
        self.buf.push(format!("{}]\t{}", now, message.into()));
    }

    /// Flush the buffered lines as a single `Logger::println` call, then clear the buffer.
    pub fn flush(&mut self) {
        self.log.println(&self.buf.join("\n"));
        self.buf.clear();
    }
}

/// `HH:MM:SS.mmm`, matching the source's log timestamp format without pulling in a datetime
/// crate the workspace doesn't otherwise depend on.
fn chrono_like_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let total_ms = now.as_millis();
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    let secs = total_secs % 60;
    let mins = (total_secs / 60) % 60;
    let hours = (total_secs / 3600) % 24;
    format!("{:02}:{:02}:{:02}.{:03}", hours, mins, secs, ms)
}

/// A [`Logger`] that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn println(&self, _message: &str) {}
}

/// A [`Logger`] that forwards to `tracing::debug!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn println(&self, message: &str) {
        tracing::debug!("{}", message);
    }
}
