//! Sliding time-window event counter used by threshold rules.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// Counts events in the trailing `window`, bounded to `capacity` timestamps.
#[derive(Debug, Clone)]
pub(crate) struct TimeWindowCounter {
    window: Duration,
    capacity: usize,
    timestamps: VecDeque<DateTime<Utc>>,
}

impl TimeWindowCounter {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            timestamps: VecDeque::new(),
        }
    }

    /// Records an event and returns the count within the window ending at it.
    pub fn record(&mut self, at: DateTime<Utc>) -> usize {
        self.timestamps.push_back(at);
        while self.timestamps.front().is_some_and(|t| at - *t > self.window) {
            self.timestamps.pop_front();
        }
        while self.timestamps.len() > self.capacity {
            self.timestamps.pop_front();
        }
        self.timestamps.len()
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.timestamps.len()
    }
}
