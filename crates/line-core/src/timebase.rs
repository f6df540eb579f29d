use std::time::{Duration, Instant};

/// Process start reference shared by the poll loops and the status report.
#[derive(Debug, Clone, Copy)]
pub struct TimeBase {
    start: Instant,
}

impl TimeBase {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for TimeBase {
    fn default() -> Self {
        Self::new()
    }
}
