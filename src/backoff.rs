//! Backoff strategies for retry policies.
//!
//! Each strategy bakes in its own uniform jitter, matching the ecosystem convention this
//! engine was modeled on: callers never stack a separate jitter decorator on top, they just
//! pick a strategy and get a jittered delay back.

use std::fmt;
use std::sync::Arc;

use rand::Rng;
use std::time::Duration;

/// Upper bound accepted for any single computed delay, guarding against misconfigured
/// exponential parameters producing an unusable multi-hour sleep.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// A backoff strategy: given a 1-indexed attempt number, produces the delay before the next
/// attempt. `attempt == 0` is treated as "no delay" by all built-in strategies.
#[derive(Clone)]
pub enum Backoff {
    /// A fixed table of per-attempt delay ceilings. Attempt `n` draws `Uniform(0, table[n-1])`;
    /// attempts beyond the table length reuse the last entry.
    Linear(Arc<[Duration]>),
    /// `ceil = min(initial * multiplier^(attempt-1), maximum)`, delay drawn `Uniform(0, ceil)`.
    Exponential { initial: Duration, maximum: Duration, multiplier: f64 },
    /// A user-supplied function, called verbatim with no additional jitter applied.
    Customized(Arc<dyn Fn(usize) -> Duration + Send + Sync>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linear(table) => f.debug_tuple("Linear").field(table).finish(),
            Self::Exponential { initial, maximum, multiplier } => f
                .debug_struct("Exponential")
                .field("initial", initial)
                .field("maximum", maximum)
                .field("multiplier", multiplier)
                .finish(),
            Self::Customized(_) => f.debug_tuple("Customized").field(&"<fn>").finish(),
        }
    }
}

/// Errors returned by the validating [`Backoff`] constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackoffBuildError {
    /// A linear backoff table must have at least one entry.
    EmptyTable,
    /// Exponential backoff requires a positive, finite multiplier.
    NonPositiveMultiplier(String),
    /// Exponential backoff requires `initial <= maximum`.
    InitialExceedsMaximum { initial: Duration, maximum: Duration },
}

impl fmt::Display for BackoffBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTable => write!(f, "linear backoff table must not be empty"),
            Self::NonPositiveMultiplier(v) => {
                write!(f, "exponential backoff multiplier must be positive, got {}", v)
            }
            Self::InitialExceedsMaximum { initial, maximum } => write!(
                f,
                "exponential backoff initial delay {:?} exceeds maximum {:?}",
                initial, maximum
            ),
        }
    }
}

impl std::error::Error for BackoffBuildError {}

impl Backoff {
    /// Build a linear backoff from a non-empty table of per-attempt ceilings.
    pub fn linear(table: Vec<Duration>) -> Result<Self, BackoffBuildError> {
        if table.is_empty() {
            return Err(BackoffBuildError::EmptyTable);
        }
        Ok(Self::Linear(table.into()))
    }

    /// Build an exponential backoff. `multiplier` must be finite and positive; `initial` must
    /// not exceed `maximum`.
    pub fn exponential(
        initial: Duration,
        maximum: Duration,
        multiplier: f64,
    ) -> Result<Self, BackoffBuildError> {
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(BackoffBuildError::NonPositiveMultiplier(multiplier.to_string()));
        }
        if initial > maximum {
            return Err(BackoffBuildError::InitialExceedsMaximum { initial, maximum });
        }
        Ok(Self::Exponential { initial, maximum, multiplier })
    }

    /// Wrap a user-supplied backoff function, called with no additional jitter.
    pub fn customized<F>(f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        Self::Customized(Arc::new(f))
    }

    /// Compute the delay before retry attempt `attempt` (1-indexed). Returns `Duration::ZERO`
    /// for `attempt == 0`.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match self {
            Self::Linear(table) => {
                let idx = attempt.min(table.len()) - 1;
                jittered(table[idx]).min(MAX_BACKOFF)
            }
            Self::Exponential { initial, maximum, multiplier } => {
                let exponent = (attempt - 1) as i32;
                let scaled = initial.as_secs_f64() * multiplier.powi(exponent);
                let ceil_secs = scaled.min(maximum.as_secs_f64()).max(0.0);
                jittered(Duration::from_secs_f64(ceil_secs)).min(MAX_BACKOFF)
            }
            // Called verbatim, per the doc comment on this variant: a caller that asks for a
            // ten-minute backoff gets one, MAX_BACKOFF only bounds the strategies this crate
            // jitters itself.
            Self::Customized(f) => f(attempt),
        }
    }
}

/// Uniform(0, ceil) jitter, matching the source strategies' `rand.Float64() * ceil` behavior.
fn jittered(ceil: Duration) -> Duration {
    if ceil.is_zero() {
        return Duration::ZERO;
    }
    let frac: f64 = rand::rng().random_range(0.0..1.0);
    Duration::from_secs_f64(ceil.as_secs_f64() * frac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_rejects_empty_table() {
        assert_eq!(Backoff::linear(vec![]).unwrap_err(), BackoffBuildError::EmptyTable);
    }

    #[test]
    fn linear_delay_is_bounded_by_table_entry() {
        let backoff = Backoff::linear(vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(300),
        ])
        .unwrap();
        for attempt in 1..=3 {
            let d = backoff.delay(attempt);
            assert!(d <= Duration::from_millis(100 * attempt as u64));
        }
    }

    #[test]
    fn linear_delay_reuses_last_entry_beyond_table() {
        let backoff = Backoff::linear(vec![Duration::from_millis(50)]).unwrap();
        assert!(backoff.delay(10) <= Duration::from_millis(50));
    }

    #[test]
    fn zero_attempt_has_no_delay() {
        let backoff = Backoff::linear(vec![Duration::from_secs(1)]).unwrap();
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }

    #[test]
    fn exponential_rejects_bad_multiplier() {
        assert!(
            Backoff::exponential(Duration::from_millis(10), Duration::from_secs(1), 0.0).is_err()
        );
    }

    #[test]
    fn exponential_rejects_initial_over_maximum() {
        assert!(
            Backoff::exponential(Duration::from_secs(5), Duration::from_secs(1), 2.0).is_err()
        );
    }

    #[test]
    fn exponential_delay_respects_maximum_ceiling() {
        let backoff =
            Backoff::exponential(Duration::from_millis(100), Duration::from_millis(500), 2.0)
                .unwrap();
        for attempt in 1..=10 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(500));
        }
    }

    #[test]
    fn customized_backoff_calls_function_verbatim() {
        let backoff = Backoff::customized(|attempt| Duration::from_millis(attempt as u64 * 7));
        assert_eq!(backoff.delay(3), Duration::from_millis(21));
        assert_eq!(backoff.delay(0), Duration::ZERO);
    }

    #[test]
    fn customized_backoff_is_not_capped_by_global_max() {
        let backoff = Backoff::customized(|_| Duration::from_secs(10_000));
        assert_eq!(backoff.delay(1), Duration::from_secs(10_000));
    }

    #[test]
    fn linear_delay_is_capped_by_global_max() {
        let backoff = Backoff::linear(vec![MAX_BACKOFF * 10]).unwrap();
        for _ in 0..20 {
            assert!(backoff.delay(1) <= MAX_BACKOFF);
        }
    }
}
