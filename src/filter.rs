//! The client-facing entry point: a filter/interceptor that sits in front of an RPC handler and
//! applies whatever retry or hedging policy the embedding application has configured for the
//! callee service and method.
//!
//! Grounded in the source's `filter.go`: `interceptor` checks a per-call disabled flag, looks up
//! the policy for `(calleeServiceName, calleeMethod)`, and either delegates straight through or
//! hands off to the retry/hedging coordinator. [`ClientFilter`] is the trait form of that
//! interceptor; [`FilterLayer`]/[`FilterService`] adapt it to `tower_service::Service` for
//! embedding applications that already compose their client stack with `tower::ServiceBuilder`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::future::BoxFuture;
use tower_layer::Layer;
use tower_service::Service;

use crate::cancellation::Cancellation;
use crate::error::EngineError;
use crate::hedging;
use crate::manager::{Dispatch, PolicyManager};
use crate::message::{try_commit_back, try_fork, ForkableMessage};
use crate::observability::ReportContext;
use crate::retry::{self, AttemptOutcome, Handler};
use crate::sleeper::Sleeper;

/// Per-call context threaded through a [`ClientFilter`] invocation: who's calling whom, whether
/// this particular call has opted out of retry/hedging entirely, and the cancellation/deadline
/// signal both executors observe.
#[derive(Debug, Clone, Default)]
pub struct FilterContext {
    pub report: ReportContext,
    pub cancellation: Cancellation,
    disabled: bool,
}

impl FilterContext {
    pub fn new(report: ReportContext) -> Self {
        Self { report, cancellation: Cancellation::new(), disabled: false }
    }
}

/// Mark a context as opted out of retry/hedging for this call only, mirroring the source's
/// `WithDisabled`. The policy lookup still runs normally for every other call sharing the same
/// `(service, method)` pair.
pub fn with_disabled(mut ctx: FilterContext) -> FilterContext {
    ctx.disabled = true;
    ctx
}

/// Whether `ctx` was marked via [`with_disabled`].
pub fn is_disabled(ctx: &FilterContext) -> bool {
    ctx.disabled
}

/// An async interceptor in front of an RPC handler, given the freedom to invoke `next` zero or
/// more times before producing a final result.
#[async_trait::async_trait]
pub trait ClientFilter<Req, Rsp, E>: Send + Sync
where
    Req: ForkableMessage,
    Rsp: Send + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    async fn invoke(
        &self,
        ctx: &FilterContext,
        req: &mut Req,
        next: Handler<Req, Rsp, E>,
    ) -> Result<Rsp, EngineError<E>>;
}

/// The concrete [`ClientFilter`] backed by a [`PolicyManager`]: looks up the dispatch for the
/// call's `(service, method)` pair and runs it through [`retry::invoke`], [`hedging::invoke`], or
/// a single pass-through call.
pub struct RetryHedgingEngine<Rsp, E> {
    manager: Arc<PolicyManager<Rsp, E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<Rsp, E> RetryHedgingEngine<Rsp, E> {
    pub fn new(manager: Arc<PolicyManager<Rsp, E>>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { manager, sleeper }
    }
}

#[async_trait::async_trait]
impl<Req, Rsp, E> ClientFilter<Req, Rsp, E> for RetryHedgingEngine<Rsp, E>
where
    Req: ForkableMessage,
    Rsp: Send + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
{
    async fn invoke(
        &self,
        ctx: &FilterContext,
        req: &mut Req,
        next: Handler<Req, Rsp, E>,
    ) -> Result<Rsp, EngineError<E>> {
        if ctx.disabled {
            return pass_through(req, next).await;
        }
        match self.manager.dispatch(&ctx.report.callee, &ctx.report.method) {
            Dispatch::Retry(policy, throttle, window) => {
                retry::invoke(
                    &policy,
                    &*throttle,
                    &window,
                    &*self.sleeper,
                    req,
                    next,
                    ctx.report.clone(),
                    &ctx.cancellation,
                )
                .await
            }
            Dispatch::Hedging(policy, throttle, window) => {
                hedging::invoke(
                    &policy,
                    &*throttle,
                    &window,
                    &*self.sleeper,
                    req,
                    next,
                    ctx.report.clone(),
                    &ctx.cancellation,
                )
                .await
            }
            Dispatch::PassThrough => pass_through(req, next).await,
        }
    }
}

async fn pass_through<Req, Rsp, E>(
    req: &mut Req,
    next: Handler<Req, Rsp, E>,
) -> Result<Rsp, EngineError<E>>
where
    Req: ForkableMessage,
{
    let forked = try_fork(req).map_err(|e| EngineError::Internal(e.to_string()))?;
    let committable = try_fork(&forked).map_err(|e| EngineError::Internal(e.to_string()))?;
    let AttemptOutcome { result, .. } = next(forked).await;
    if result.is_ok() {
        try_commit_back(req, &committable).map_err(|e| EngineError::Internal(e.to_string()))?;
    }
    result.map_err(EngineError::Fatal)
}

/// A request paired with the [`FilterContext`] identifying its call site, the shape
/// [`FilterService`] expects so it can both dispatch on `(service, method)` and fork the request
/// for each attempt.
pub struct FilterRequest<Req> {
    pub ctx: FilterContext,
    pub req: Req,
}

/// Tower layer that wraps an inner `Service<Req, Response = Rsp, Error = E>` with retry/hedging
/// dispatch, the same `Layer`/`Service` shape this codebase already uses for single-policy
/// middleware.
///
/// The inner service is cloned once per attempt (tower services are cheap handles by
/// convention), so `S: Clone` is required. Response metadata used for server pushback is only
/// available through the richer [`ClientFilter`] entry point; services adapted through this layer
/// are treated as opaque and never report pushback, matching a handler whose wire format doesn't
/// expose per-attempt metadata to begin with.
#[derive(Clone)]
pub struct FilterLayer<Rsp, E> {
    manager: Arc<PolicyManager<Rsp, E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<Rsp, E> FilterLayer<Rsp, E> {
    pub fn new(manager: Arc<PolicyManager<Rsp, E>>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { manager, sleeper }
    }
}

/// Service produced by [`FilterLayer`].
#[derive(Clone)]
pub struct FilterService<S, Rsp, E> {
    inner: S,
    manager: Arc<PolicyManager<Rsp, E>>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S, Rsp, E> FilterService<S, Rsp, E> {
    fn new(inner: S, manager: Arc<PolicyManager<Rsp, E>>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { inner, manager, sleeper }
    }
}

impl<S, Rsp, E> Layer<S> for FilterLayer<Rsp, E> {
    type Service = FilterService<S, Rsp, E>;
    fn layer(&self, inner: S) -> Self::Service {
        FilterService::new(inner, self.manager.clone(), self.sleeper.clone())
    }
}

impl<S, Req, Rsp, E> Service<FilterRequest<Req>> for FilterService<S, Rsp, E>
where
    Req: ForkableMessage,
    Rsp: Send + 'static,
    E: std::error::Error + Clone + Send + Sync + 'static,
    S: Service<Req, Response = Rsp, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Rsp;
    type Error = EngineError<E>;
    type Future = BoxFuture<'static, Result<Rsp, EngineError<E>>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(EngineError::Fatal)
    }

    fn call(&mut self, request: FilterRequest<Req>) -> Self::Future {
        let FilterRequest { ctx, req } = request;
        let manager = self.manager.clone();
        let sleeper = self.sleeper.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            let mut req = req;
            let next = into_handler(inner);
            if ctx.disabled {
                return pass_through(&mut req, next).await;
            }
            match manager.dispatch(&ctx.report.callee, &ctx.report.method) {
                Dispatch::Retry(policy, throttle, window) => {
                    retry::invoke(
                        &policy,
                        &*throttle,
                        &window,
                        &*sleeper,
                        &mut req,
                        next,
                        ctx.report,
                        &ctx.cancellation,
                    )
                    .await
                }
                Dispatch::Hedging(policy, throttle, window) => {
                    hedging::invoke(
                        &policy,
                        &*throttle,
                        &window,
                        &*sleeper,
                        &mut req,
                        next,
                        ctx.report,
                        &ctx.cancellation,
                    )
                    .await
                }
                Dispatch::PassThrough => pass_through(&mut req, next).await,
            }
        })
    }
}

type InnerFuture<Rsp, E> = Pin<Box<dyn Future<Output = Result<Rsp, E>> + Send>>;

/// Wrap a `Clone` tower `Service` as a [`Handler`]: each call clones the service so concurrent
/// hedged attempts never share a `&mut self`, drives it to readiness, and reports no response
/// metadata (see [`FilterLayer`]'s doc comment).
fn into_handler<S, Req, Rsp, E>(inner: S) -> Handler<Req, Rsp, E>
where
    Req: Send + 'static,
    Rsp: Send + 'static,
    E: Send + Sync + 'static,
    S: Service<Req, Response = Rsp, Error = E> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    Arc::new(move |req: Req| {
        let mut svc = inner.clone();
        let fut: InnerFuture<Rsp, E> = Box::pin(async move {
            std::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
            svc.call(req).await
        });
        Box::pin(async move {
            let result = fut.await;
            AttemptOutcome { result, metadata: Default::default() }
        })
    })
}
