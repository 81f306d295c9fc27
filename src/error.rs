//! Error types for the retry/hedging engine.

use std::fmt;
use std::time::Duration;

/// Cap the number of stored attempt errors inside `RetryableExhausted` to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type surfaced by the engine to the caller.
///
/// Generic over `E`, the downstream handler's error type. `E: Clone` is required because a
/// pushback "no more attempts" classification and the final commit step both inspect the same
/// underlying error independently.
#[derive(Debug)]
pub enum EngineError<E> {
    /// The caller's deadline elapsed while the engine held control.
    Timeout { elapsed: Duration, attempts: usize },
    /// The caller explicitly cancelled the invocation.
    Cancelled,
    /// Retry reached `maxAttempts` and the last result was still classified retryable.
    RetryableExhausted { attempts: usize, failures: Vec<E> },
    /// A fatal (non-retryable) error was returned by the handler or the response validator.
    Fatal(E),
    /// The engine's own support logic failed: message copier panic, pushback parse failure,
    /// or configuration decoding failure.
    Internal(String),
}

impl<E: Clone> Clone for EngineError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Timeout { elapsed, attempts } => {
                Self::Timeout { elapsed: *elapsed, attempts: *attempts }
            }
            Self::Cancelled => Self::Cancelled,
            Self::RetryableExhausted { attempts, failures } => {
                Self::RetryableExhausted { attempts: *attempts, failures: failures.clone() }
            }
            Self::Fatal(e) => Self::Fatal(e.clone()),
            Self::Internal(msg) => Self::Internal(msg.clone()),
        }
    }
}

impl<E: PartialEq> PartialEq for EngineError<E> {
    fn eq(&self, other: &Self) -> bool {
        use EngineError::*;
        match (self, other) {
            (Timeout { elapsed: a1, attempts: b1 }, Timeout { elapsed: a2, attempts: b2 }) => {
                a1 == a2 && b1 == b2
            }
            (Cancelled, Cancelled) => true,
            (
                RetryableExhausted { attempts: a1, failures: f1 },
                RetryableExhausted { attempts: a2, failures: f2 },
            ) => a1 == a2 && f1 == f2,
            (Fatal(e1), Fatal(e2)) => e1 == e2,
            (Internal(m1), Internal(m2)) => m1 == m2,
            _ => false,
        }
    }
}

impl<E: Eq> Eq for EngineError<E> {}

impl<E: fmt::Display> fmt::Display for EngineError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, attempts } => {
                write!(f, "request timeout after {:?} ({} attempt(s))", elapsed, attempts)
            }
            Self::Cancelled => write!(f, "request cancelled"),
            Self::RetryableExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} recorded), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Fatal(e) => write!(f, "{}", e),
            Self::Internal(msg) => write!(f, "internal engine error: {}", msg),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for EngineError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Fatal(e) => Some(e),
            Self::RetryableExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            _ => None,
        }
    }
}

impl<E> EngineError<E> {
    /// Truncate an accumulated failure list to `MAX_RETRY_FAILURES`, keeping the most recent.
    pub fn cap_failures(mut failures: Vec<E>) -> Vec<E> {
        if failures.len() > MAX_RETRY_FAILURES {
            let drop = failures.len() - MAX_RETRY_FAILURES;
            failures.drain(0..drop);
        }
        failures
    }

    /// Check if this error is due to timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is due to cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error is due to retry exhaustion.
    pub fn is_retryable_exhausted(&self) -> bool {
        matches!(self, Self::RetryableExhausted { .. })
    }

    /// Check if this error is a fatal handler error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Check if this error originates inside the engine's own support logic.
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }

    /// Access all recorded failures for `RetryableExhausted`, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryableExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// Borrow the wrapped fatal error, if present.
    pub fn as_fatal(&self) -> Option<&E> {
        match self {
            Self::Fatal(e) => Some(e),
            _ => None,
        }
    }

    /// Take ownership of the wrapped fatal error, if present.
    pub fn into_fatal(self) -> Option<E> {
        match self {
            Self::Fatal(e) => Some(e),
            _ => None,
        }
    }
}
