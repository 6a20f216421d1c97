//! Retry backoff schedule.

use std::time::Duration;

/// Exponential backoff with jitter for the given attempt count.
///
/// `min(base * 2^(attempts-1), cap)`, scaled by a random factor in
/// `0.5..1.5` so retrying jobs don't stampede the same instant.
pub fn backoff(attempts: i32, base: Duration, cap: Duration) -> Duration {
    let exponent = attempts.max(1) as u32 - 1;
    let raw = base
        .checked_mul(2u32.saturating_pow(exponent))
        .unwrap_or(cap)
        .min(cap);
    let jitter = 0.5 + fastrand::f64();
    raw.mul_f64(jitter)
}
