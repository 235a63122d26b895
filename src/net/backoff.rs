//! Exponential backoff with jitter for accept loops.

use std::time::Duration;
use rand::Rng;

/// First delay after a temporary accept error.
pub const ACCEPT_BACKOFF_BASE_MS: u64 = 5;

/// Upper bound on the delay between accept attempts, before jitter.
pub const ACCEPT_BACKOFF_MAX_MS: u64 = 1_000;

/// Delay before the next accept after `failures` consecutive temporary errors.
///
/// Doubles from [`ACCEPT_BACKOFF_BASE_MS`] up to [`ACCEPT_BACKOFF_MAX_MS`], plus
/// up to 10% jitter so workers sharing a resource limit do not retry in step.
pub fn accept_backoff(failures: u32) -> Duration {
    if failures == 0 {
        return Duration::ZERO;
    }

    let doublings = (failures - 1).min(63);
    let delay_ms = ACCEPT_BACKOFF_BASE_MS
        .saturating_mul(1u64 << doublings)
        .min(ACCEPT_BACKOFF_MAX_MS);

    let jitter_ms = match delay_ms / 10 {
        0 => 0,
        range => rand::thread_rng().gen_range(0..range),
    };

    Duration::from_millis(delay_ms + jitter_ms)
}
