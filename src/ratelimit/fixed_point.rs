//! Fixed-point encoding of seconds and token quantities.
//!
//! The store only does integer arithmetic, so every value it holds is scaled
//! by [`SCALE`] and truncated. Timestamps become epoch milliseconds and
//! allowances become thousandths of a request.

use std::time::Duration;

/// Units per whole second or whole request.
pub const SCALE: i64 = 1000;

/// Absorbs binary representation error before flooring, so that e.g. `0.29`
/// encodes to 290 rather than 289.
const EPSILON: f64 = 1e-9;

/// Encode a quantity, truncating towards negative infinity.
pub fn encode(x: f64) -> i64 {
    (x * SCALE as f64 + EPSILON).floor() as i64
}

/// Decode a quantity.
pub fn decode(n: i64) -> f64 {
    n as f64 / SCALE as f64
}

/// Encode a duration, truncating below the resolution.
pub fn encode_duration(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Decode a non-negative amount of units as a duration.
pub fn decode_duration(n: i64) -> Duration {
    Duration::from_millis(n.max(0) as u64)
}
