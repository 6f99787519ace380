//! Loop-pacing helper enforcing a minimum iteration period.

use std::thread;
use std::time::{Duration, Instant};

/// Sleeps out the remainder of a fixed period since the last call, so a
/// tight loop around `Throttler::wait` runs at most once per `period`.
pub struct Throttler {
    period: Duration,
    last: Instant,
}

impl Throttler {
    #[must_use]
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last: Instant::now(),
        }
    }

    /// Blocks until `period` has elapsed since the previous `wait` (or
    /// construction, for the first call).
    pub fn wait(&mut self) {
        let elapsed = self.last.elapsed();
        if elapsed < self.period {
            thread::sleep(self.period - elapsed);
        }
        self.last = Instant::now();
    }
}
