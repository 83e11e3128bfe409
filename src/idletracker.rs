use std::time::{Instant, Duration};

/// Tracks the last time bytes moved on a proxied connection.
pub struct IdleTracker {
    last_active: Instant,
    max_idle: Duration,
}

impl IdleTracker {
    /// `max_idle_ms` of 0 means the connection never expires
    pub fn new(max_idle_ms: u64) -> IdleTracker {
        let max_idle_ms = if max_idle_ms == 0 { u64::MAX } else { max_idle_ms };
        IdleTracker {
            last_active: Instant::now(),
            max_idle: Duration::from_millis(max_idle_ms),
        }
    }

    pub fn mark(&mut self) -> Instant {
        std::mem::replace(&mut self.last_active, Instant::now())
    }

    pub fn max_idle(&self) -> Duration {
        self.max_idle
    }

    pub fn is_expired(&self) -> bool {
        self.last_active.elapsed() > self.max_idle
    }

    pub fn idled_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}
