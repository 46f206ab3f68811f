//! Transfer speed cap
//!
//! Paces one transfer so its average rate since the first byte stays at or
//! below the limit. Each transfer owns its own throttle.

use std::time::Duration;
use tokio::time::Instant;

pub(crate) struct Throttle {
    bytes_per_second: u64,
    started: Instant,
    consumed: u64,
}

impl Throttle {
    /// A zero limit is treated as one byte per second
    pub(crate) fn new(bytes_per_second: u64) -> Self {
        Self {
            bytes_per_second: bytes_per_second.max(1),
            started: Instant::now(),
            consumed: 0,
        }
    }

    /// Account for `bytes` just written and sleep until the average rate
    /// is back under the limit
    pub(crate) async fn consume(&mut self, bytes: u64) {
        self.consumed = self.consumed.saturating_add(bytes);
        let due = self.due();
        let elapsed = self.started.elapsed();
        if due > elapsed {
            tokio::time::sleep(due - elapsed).await;
        }
    }

    /// Earliest offset from the start at which `consumed` bytes are allowed
    fn due(&self) -> Duration {
        Duration::from_secs_f64(self.consumed as f64 / self.bytes_per_second as f64)
    }
}
