//! Adaptive token-bucket throttle, gating retry and hedging attempts to prevent retry storms.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Upper bound accepted for `TokenBucketThrottle::new`'s `max_tokens`.
pub const MAXIMUM_TOKENS: f64 = 1000.0;

/// Gates additional attempts based on recent success/failure history.
pub trait Throttle: Send + Sync {
    /// Whether a new attempt may be issued right now.
    fn allow(&self) -> bool;
    /// Record a successful attempt, replenishing tokens.
    fn on_success(&self);
    /// Record a failed attempt, spending a token.
    fn on_failure(&self);
}

/// A throttle that never gates anything. Used when a policy opts out of throttling.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopThrottle;

impl Throttle for NoopThrottle {
    fn allow(&self) -> bool {
        true
    }
    fn on_success(&self) {}
    fn on_failure(&self) {}
}

/// Errors returned building a [`TokenBucketThrottle`].
#[derive(Debug, Clone, PartialEq)]
pub enum ThrottleBuildError {
    /// `max_tokens` exceeded [`MAXIMUM_TOKENS`].
    TooManyTokens(f64),
    /// `max_tokens` was not positive.
    NonPositiveTokens(f64),
    /// `token_ratio` was not positive.
    NonPositiveRatio(f64),
}

impl fmt::Display for ThrottleBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyTokens(v) => {
                write!(f, "expect tokens less or equal to {}, got {}", MAXIMUM_TOKENS, v)
            }
            Self::NonPositiveTokens(v) => write!(f, "expect positive tokens, got {}", v),
            Self::NonPositiveRatio(v) => write!(f, "expect positive token ratio, got {}", v),
        }
    }
}

impl std::error::Error for ThrottleBuildError {}

/// Lock-free token-bucket throttle. An attempt is allowed only while the bucket holds more than
/// half its capacity; successes replenish by `token_ratio`, failures spend exactly one token.
pub struct TokenBucketThrottle {
    tokens: AtomicU64,
    max_tokens: f64,
    threshold: f64,
    token_ratio: f64,
}

impl fmt::Debug for TokenBucketThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucketThrottle")
            .field("tokens", &self.current_tokens())
            .field("max_tokens", &self.max_tokens)
            .field("threshold", &self.threshold)
            .field("token_ratio", &self.token_ratio)
            .finish()
    }
}

impl TokenBucketThrottle {
    /// Construct a new token bucket, starting full.
    pub fn new(max_tokens: f64, token_ratio: f64) -> Result<Self, ThrottleBuildError> {
        if max_tokens > MAXIMUM_TOKENS {
            return Err(ThrottleBuildError::TooManyTokens(max_tokens));
        }
        if max_tokens <= 0.0 {
            return Err(ThrottleBuildError::NonPositiveTokens(max_tokens));
        }
        if token_ratio <= 0.0 {
            return Err(ThrottleBuildError::NonPositiveRatio(token_ratio));
        }
        Ok(Self {
            tokens: AtomicU64::new(max_tokens.to_bits()),
            max_tokens,
            threshold: max_tokens / 2.0,
            token_ratio,
        })
    }

    fn current_tokens(&self) -> f64 {
        f64::from_bits(self.tokens.load(Ordering::Acquire))
    }
}

impl Throttle for TokenBucketThrottle {
    fn allow(&self) -> bool {
        self.current_tokens() > self.threshold
    }

    fn on_success(&self) {
        loop {
            let bits = self.tokens.load(Ordering::Acquire);
            let tokens = f64::from_bits(bits);
            if tokens == self.max_tokens {
                return;
            }
            let new_tokens = (tokens + self.token_ratio).min(self.max_tokens);
            if self
                .tokens
                .compare_exchange(
                    bits,
                    new_tokens.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }

    fn on_failure(&self) {
        loop {
            let bits = self.tokens.load(Ordering::Acquire);
            let tokens = f64::from_bits(bits);
            if tokens == 0.0 {
                return;
            }
            let new_tokens = (tokens - 1.0).max(0.0);
            if self
                .tokens
                .compare_exchange(
                    bits,
                    new_tokens.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn rejects_invalid_construction() {
        assert!(TokenBucketThrottle::new(MAXIMUM_TOKENS + 1.0, 1.0).is_err());
        assert!(TokenBucketThrottle::new(0.0, 1.0).is_err());
        assert!(TokenBucketThrottle::new(10.0, 0.0).is_err());
    }

    #[test]
    fn starts_full_and_allows() {
        let tb = TokenBucketThrottle::new(10.0, 1.0).unwrap();
        assert!(tb.allow());
    }

    #[test]
    fn failures_below_threshold_block_further_attempts() {
        let tb = TokenBucketThrottle::new(10.0, 1.0).unwrap();
        for _ in 0..6 {
            tb.on_failure();
        }
        assert!(!tb.allow());
    }

    #[test]
    fn success_replenishes_up_to_max() {
        let tb = TokenBucketThrottle::new(10.0, 5.0).unwrap();
        for _ in 0..10 {
            tb.on_failure();
        }
        tb.on_success();
        tb.on_success();
        assert_eq!(tb.current_tokens(), 10.0);
    }

    #[test]
    fn failure_never_drops_below_zero() {
        let tb = TokenBucketThrottle::new(1.0, 1.0).unwrap();
        for _ in 0..5 {
            tb.on_failure();
        }
        assert_eq!(tb.current_tokens(), 0.0);
    }

    #[test]
    fn noop_throttle_always_allows() {
        let tb = NoopThrottle;
        tb.on_failure();
        tb.on_failure();
        assert!(tb.allow());
    }

    #[test]
    fn concurrent_updates_stay_within_bounds() {
        let tb = Arc::new(TokenBucketThrottle::new(100.0, 3.0).unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let tb = tb.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    if i % 2 == 0 {
                        tb.on_success();
                    } else {
                        tb.on_failure();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let tokens = tb.current_tokens();
        assert!(tokens >= 0.0 && tokens <= 100.0);
    }
}
