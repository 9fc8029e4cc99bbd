// Time source for readiness polling and wait deadlines
use std::time::{Duration, Instant};

/// Abstracts "now" and "sleep" so polling loops can be driven by a fake clock in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);

    /// Time elapsed since `start` according to this clock
    fn elapsed_since(&self, start: Instant) -> Duration {
        self.now().saturating_duration_since(start)
    }
}

/// Wall clock backed by `Instant::now` and `thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
