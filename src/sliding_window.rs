//! Approximate sliding-window event counter, feeding rate-style observability gauges without
//! depending on an external metrics engine for rate computation.
//!
//! Not grounded in any one source file: no corpus implementation of an approximate two-bucket
//! counter was found, so this is built from first principles in the codebase's own idiom (a
//! single mutex guarding the rotation boundary, matching how the counter it is modeled after
//! is itself single-mutex-guarded).

use std::sync::Mutex;
use std::time::{Duration, Instant};

struct State {
    current: u64,
    previous: u64,
    bucket_start: Instant,
}

/// Approximates the number of events recorded within the trailing window `w` by splitting it
/// into two half-window buckets and linearly decaying the older one as the current bucket fills.
pub struct SlidingWindowCounter {
    half_window: Duration,
    state: Mutex<State>,
}

impl SlidingWindowCounter {
    /// Create a counter over window `w`, split into two `w / 2` buckets. `w` must be positive;
    /// if it rounds to a zero half-window, it is clamped to 1ms.
    pub fn new(w: Duration) -> Self {
        let half_window = (w / 2).max(Duration::from_millis(1));
        Self {
            half_window,
            state: Mutex::new(State { current: 0, previous: 0, bucket_start: Instant::now() }),
        }
    }

    fn rotate_if_needed(state: &mut State, half_window: Duration, now: Instant) {
        let elapsed = now.saturating_duration_since(state.bucket_start);
        if elapsed >= half_window {
            let periods = (elapsed.as_nanos() / half_window.as_nanos()).min(2) as u32;
            match periods {
                1 => {
                    state.previous = state.current;
                    state.current = 0;
                }
                _ => {
                    state.previous = 0;
                    state.current = 0;
                }
            }
            state.bucket_start = now;
        }
    }

    /// Record one event at the current instant.
    pub fn record(&self) {
        let mut state = self.state.lock().expect("sliding window mutex poisoned");
        Self::rotate_if_needed(&mut state, self.half_window, Instant::now());
        state.current += 1;
    }

    /// Approximate the count of events within the trailing window.
    pub fn count(&self) -> f64 {
        let mut state = self.state.lock().expect("sliding window mutex poisoned");
        let now = Instant::now();
        Self::rotate_if_needed(&mut state, self.half_window, now);
        let elapsed_in_current = now.saturating_duration_since(state.bucket_start);
        let frac = (elapsed_in_current.as_secs_f64() / self.half_window.as_secs_f64()).min(1.0);
        state.current as f64 + state.previous as f64 * (1.0 - frac)
    }
}
