//! Deadline timer checked from the cycle tick.

use std::time::{Duration, Instant};

/// A one-shot deadline that is polled rather than awaited.
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingTimer {
    deadline: Option<Instant>,
}

impl PollingTimer {
    #[must_use]
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Arm the timer. A negative timeout disarms it.
    pub fn set_timeout(&mut self, timeout_ms: i64) {
        self.deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
    }

    pub const fn stop(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once when the deadline has passed. Disarms the timer.
    pub fn is_expired(&mut self) -> bool {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
