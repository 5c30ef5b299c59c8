use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay with random jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        let max = max.max(base);
        Self {
            base,
            max,
            current: base,
        }
    }

    /// Delay before the next attempt; doubles the window for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let window_ms = self.current.as_millis() as u64;
        let jitter_ms = if window_ms > 1 {
            rand::thread_rng().gen_range(0..=window_ms / 2)
        } else {
            0
        };
        let delay = (self.current + Duration::from_millis(jitter_ms)).min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}
