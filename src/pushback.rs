//! Server pushback: lets a callee override the caller's next retry delay, or veto further
//! attempts entirely, via response metadata.

use std::collections::HashMap;
use std::time::Duration;

/// Metadata key a callee sets to signal pushback.
pub const PUSHBACK_KEY: &str = "trpc-pushback-delay";

/// The caller's interpretation of a pushback value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pushback {
    /// Wait exactly this long before the next attempt, overriding the policy's own backoff.
    Delay(Duration),
    /// Retry immediately with no delay.
    Immediate,
    /// Stop retrying; the callee does not want any more attempts.
    NoMoreAttempts,
}

/// Parse a pushback value out of response metadata, following signed-duration semantics: a
/// positive duration overrides the next delay, zero means immediate retry, and a negative
/// duration means "no more attempts".
pub fn from_metadata(metadata: &HashMap<String, String>) -> Option<Pushback> {
    let raw = metadata.get(PUSHBACK_KEY)?;
    parse_signed_duration(raw).map(|signed| {
        if signed > 0 {
            Pushback::Delay(Duration::from_nanos(signed as u64))
        } else if signed == 0 {
            Pushback::Immediate
        } else {
            Pushback::NoMoreAttempts
        }
    })
}

/// Parse a signed nanosecond duration from a `humantime`-style string (`"1.5s"`, `"-200ms"`,
/// `"0"`). Returns `None` on malformed input, mirroring the source adapter's "ignore unparsable
/// pushback" behavior rather than treating it as fatal.
fn parse_signed_duration(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw == "0" {
        return Some(0);
    }
    let (negative, rest) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let unit_len = rest.chars().rev().take_while(|c| c.is_alphabetic()).count();
    if unit_len == 0 || unit_len >= rest.len() {
        return None;
    }
    let split_at = rest.len() - unit_len;
    let (value, unit) = rest.split_at(split_at);
    let value: f64 = value.parse().ok()?;
    let nanos_per_unit: f64 = match unit {
        "ns" => 1.0,
        "us" | "µs" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" => 1_000_000_000.0,
        "m" => 60.0 * 1_000_000_000.0,
        "h" => 3_600.0 * 1_000_000_000.0,
        _ => return None,
    };
    let nanos = (value * nanos_per_unit).round() as i64;
    Some(if negative { -nanos } else { nanos })
}
