//! Timestamp validation for signed launch requests
//!
//! A launch carries a whole-second UNIX timestamp that must be recent for
//! the request to be admissible. Values arrive from an untyped boundary
//! (form fields, JSON bodies), so validation starts from [`serde_json::Value`]
//! rather than an already-typed integer.

use serde_json::Value;

/// Default freshness window in seconds (90 minutes), the replay window
/// recommended for LTI 1.x launches.
pub const DEFAULT_LIFETIME_SECS: i64 = 5400;

/// Source of "now" in whole UNIX seconds, injectable so freshness checks
/// are deterministic under test.
pub trait Clock: Send + Sync {
    fn unix_now(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Argument errors from [`is_fresh`].
#[derive(Debug, thiserror::Error)]
pub enum TimestampError {
    #[error("timestamp must be a positive whole number of unix seconds; got {0}")]
    NotATimestamp(i64),
    #[error("lifetime must be a positive number of seconds; got {0}")]
    InvalidLifetime(i64),
}

/// Parse a UNIX timestamp out of an untyped value.
///
/// Accepts JSON strings and numbers representing a whole, strictly positive
/// integer. Booleans never pass, even though `true` would coerce to 1 under
/// a numeric cast. Returns `None` for everything else; never panics.
#[must_use]
pub fn parse_unix(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().filter(|&secs| secs > 0),
        Value::String(s) => s.parse::<i64>().ok().filter(|&secs| secs > 0),
        _ => None,
    }
}

/// Whether the given untyped value is a valid UNIX timestamp.
#[must_use]
pub fn is_timestamp(value: &Value) -> bool {
    parse_unix(value).is_some()
}

/// Whether `timestamp` is within `lifetime_secs` of the clock's now.
///
/// A timestamp from the future (negative age) counts as fresh; that is
/// deliberate tolerance for clock skew between the signer and this host.
///
/// # Errors
///
/// Returns [`TimestampError`] if `timestamp` or `lifetime_secs` is not a
/// positive integer. These are caller bugs, not protocol outcomes.
pub fn is_fresh(
    timestamp: i64,
    lifetime_secs: i64,
    clock: &dyn Clock,
) -> Result<bool, TimestampError> {
    if timestamp <= 0 {
        return Err(TimestampError::NotATimestamp(timestamp));
    }
    if lifetime_secs <= 0 {
        return Err(TimestampError::InvalidLifetime(lifetime_secs));
    }
    // Saturating keeps far-future timestamps on the fresh side instead of
    // wrapping.
    Ok(clock.unix_now().saturating_sub(timestamp) <= lifetime_secs)
}

#[cfg(test)]
pub(crate) struct FixedClock(pub i64);

#[cfg(test)]
impl Clock for FixedClock {
    fn unix_now(&self) -> i64 {
        self.0
    }
}
