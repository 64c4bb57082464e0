use std::time::Duration;

use rand::RngExt;

/// First backoff base in milliseconds.
pub const BASE_DELAY_MS: u64 = 500;

/// Ceiling for the exponential base.
pub const MAX_DELAY_MS: u64 = 8_000;

const EXPONENT_CAP: u32 = 6;

/// Exponential base for a 1-indexed attempt: `min(500 · 2^(attempt−1), 8000)`.
pub fn backoff_base_ms(attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(EXPONENT_CAP);
    (BASE_DELAY_MS << exponent).min(MAX_DELAY_MS)
}

/// Delay before the given attempt: half the base plus additive jitter up to
/// half the base, so attempt 1 sleeps somewhere in [250 ms, 500 ms] and late
/// attempts in [4 s, 8 s].
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = backoff_base_ms(attempt);
    let jitter = rand::rng().random_range(0..=base / 2);
    Duration::from_millis(base / 2 + jitter)
}
