//! Message forking and commit-back, the protocol-agnostic copy step every hedged or retried
//! attempt needs: a fresh per-attempt copy of the request on the way out, and a shallow copy of
//! the winning response back onto the caller's original value on the way in.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

/// A message type the engine can fork for a new attempt and commit back into the caller's
/// original value once an attempt wins.
///
/// Implementors typically wrap a request/response pair carried through a codec; `fork` must
/// produce an independent copy so concurrent attempts cannot race on shared state, and
/// `commit_back` must copy the winner's data into `self` without replacing the caller's
/// original allocation (callers may hold long-lived references to it).
pub trait ForkableMessage: Send + 'static {
    /// Produce an independent copy of this message for a new attempt.
    fn fork(&self) -> Self
    where
        Self: Sized;

    /// Copy `winner`'s contents back into `self`, the caller's original message.
    fn commit_back(&mut self, winner: &Self)
    where
        Self: Sized;
}

/// Error raised when forking or committing back a message panics. Protocols whose message types
/// cannot be safely copied (self-referential buffers, non-`Send` internals) surface here instead
/// of unwinding through the engine.
#[derive(Debug)]
pub struct CopierError {
    panic_payload: String,
}

impl fmt::Display for CopierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "message copy panicked, this usually means the engine may not support this protocol: {}",
            self.panic_payload
        )
    }
}

impl std::error::Error for CopierError {}

fn describe_panic(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Fork `msg`, catching any panic raised by its `fork` implementation.
pub fn try_fork<M: ForkableMessage>(msg: &M) -> Result<M, CopierError> {
    panic::catch_unwind(AssertUnwindSafe(|| msg.fork()))
        .map_err(|payload| CopierError { panic_payload: describe_panic(payload) })
}

/// Commit `winner` back into `dst`, catching any panic raised by `commit_back`.
pub fn try_commit_back<M: ForkableMessage>(dst: &mut M, winner: &M) -> Result<(), CopierError> {
    panic::catch_unwind(AssertUnwindSafe(|| dst.commit_back(winner)))
        .map_err(|payload| CopierError { panic_payload: describe_panic(payload) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Envelope {
        body: String,
    }

    impl ForkableMessage for Envelope {
        fn fork(&self) -> Self {
            Envelope { body: self.body.clone() }
        }
        fn commit_back(&mut self, winner: &Self) {
            self.body = winner.body.clone();
        }
    }

    struct PanicsOnFork;

    impl ForkableMessage for PanicsOnFork {
        fn fork(&self) -> Self {
            panic!("protocol does not support copying");
        }
        fn commit_back(&mut self, _winner: &Self) {}
    }

    #[test]
    fn fork_produces_independent_copy() {
        let original = Envelope { body: "hello".into() };
        let copy = try_fork(&original).unwrap();
        assert_eq!(copy.body, "hello");
    }

    #[test]
    fn commit_back_overwrites_caller_message() {
        let mut caller = Envelope { body: "stale".into() };
        let winner = Envelope { body: "fresh".into() };
        try_commit_back(&mut caller, &winner).unwrap();
        assert_eq!(caller.body, "fresh");
    }

    #[test]
    fn fork_panic_is_captured_as_error() {
        let msg = PanicsOnFork;
        let err = try_fork(&msg).unwrap_err();
        assert!(err.to_string().contains("may not support this protocol"));
    }
}
