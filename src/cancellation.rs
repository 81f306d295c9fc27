//! Caller cancellation and deadline observation (the source's `ctx.Done()`), threaded through
//! both executors' suspension points.
//!
//! The source has a single channel meaning both "caller cancelled explicitly" and "caller's
//! deadline elapsed". Rust has no one type that means both, so this wraps a
//! [`tokio_util::sync::CancellationToken`] (explicit cancellation) alongside an optional deadline,
//! and exposes one `done()` future that resolves on whichever fires first, naming which.

use std::time::Instant;

use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

/// Why [`Cancellation::done`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    /// The caller cancelled explicitly.
    Cancelled,
    /// The caller's deadline elapsed.
    Timeout,
}

/// One invocation's cancellation signal: an explicit token plus an optional deadline.
///
/// Cloning shares the same underlying token — cancelling one clone cancels every other, matching
/// [`CancellationToken`]'s own semantics.
#[derive(Debug, Clone)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// No deadline, not yet cancelled.
    pub fn new() -> Self {
        Self { token: CancellationToken::new(), deadline: None }
    }

    /// Not yet cancelled, but [`done`](Self::done) resolves once `deadline` passes.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self { token: CancellationToken::new(), deadline: Some(deadline) }
    }

    /// A token an embedding application can cancel directly, or a downstream handler can race
    /// cooperatively against its own I/O.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel explicitly.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolves once either the token is cancelled or the deadline elapses, naming which. Never
    /// resolves if neither is set.
    pub async fn done(&self) -> DoneReason {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => DoneReason::Cancelled,
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => DoneReason::Timeout,
                }
            }
            None => {
                self.token.cancelled().await;
                DoneReason::Cancelled
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Turn a [`DoneReason`] observed mid-invocation into the [`EngineError`] an executor returns.
pub fn as_engine_error<E>(
    reason: DoneReason,
    elapsed: std::time::Duration,
    attempts: usize,
) -> EngineError<E> {
    match reason {
        DoneReason::Cancelled => EngineError::Cancelled,
        DoneReason::Timeout => EngineError::Timeout { elapsed, attempts },
    }
}
