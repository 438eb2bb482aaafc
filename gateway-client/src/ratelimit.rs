//! Per-opcode rate-limit history: a server-sent `RATE_LIMITED` dispatch records
//! `{opcode, retry_after}`, and any later send of that opcode must wait out the
//! remaining window before it goes on the wire.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
pub struct RateLimitTracker {
    until: Mutex<HashMap<u8, Instant>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `opcode` is rate-limited for `retry_after` from now.
    pub async fn record(&self, opcode: u8, retry_after: Duration) {
        self.until.lock().await.insert(opcode, Instant::now() + retry_after);
    }

    /// Sleeps until any previously recorded rate-limit window for `opcode` has
    /// elapsed. A no-op if `opcode` was never rate-limited or its window already
    /// passed.
    pub async fn wait_for_availability(&self, opcode: u8) {
        let deadline = self.until.lock().await.get(&opcode).copied();
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_is_immediate_when_no_limit_is_recorded() {
        let tracker = RateLimitTracker::new();
        let started = Instant::now();
        tracker.wait_for_availability(1).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_the_recorded_window_elapses() {
        let tracker = RateLimitTracker::new();
        tracker.record(1, Duration::from_millis(200)).await;

        let wait = tracker.wait_for_availability(1);
        tokio::pin!(wait);

        tokio::select! {
            _ = &mut wait => panic!("resolved before the window elapsed"),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }

        wait.await;
    }
}
