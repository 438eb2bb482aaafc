//! Reconnect backoff: base 200 ms, factor 2, capped at 5 s, bounded at 5 attempts.

use std::time::Duration;

const BASE_MS: u64 = 200;
const FACTOR: u64 = 2;
const CAP_MS: u64 = 5_000;
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay before reconnect attempt `attempt` (1-indexed: the first retry is attempt 1).
/// `attempt` 1..5 yields 400, 800, 1600, 3200, 5000 (capped) ms, matching the
/// documented scenario's observed sequence.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    let scaled = BASE_MS.saturating_mul(FACTOR.saturating_pow(attempt));
    Duration::from_millis(scaled.min(CAP_MS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_documented_backoff_sequence() {
        let expected_ms = [400, 800, 1600, 3200, 5000];
        for (attempt, expected) in (1..=5u32).zip(expected_ms) {
            assert_eq!(delay_for_attempt(attempt), Duration::from_millis(expected));
        }
    }

    #[test]
    fn caps_at_five_seconds() {
        assert_eq!(delay_for_attempt(10), Duration::from_millis(CAP_MS));
    }
}
