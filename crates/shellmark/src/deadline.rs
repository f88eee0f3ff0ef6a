//! Absolute deadlines for polling loops

use std::time::Duration;
use tokio::time::Instant;

/// A point in time fixed once when a call starts.
///
/// Every wait inside the call is measured against the same instant, so
/// polling never restarts the clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    timeout: Duration,
}

impl Deadline {
    /// Deadline `timeout` from now
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now() + timeout,
            timeout,
        }
    }

    /// The instant the deadline falls on
    pub fn instant(&self) -> Instant {
        self.at
    }

    /// The timeout the deadline was built from
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Time left, zero once expired
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed
    pub fn expired(&self) -> bool {
        Instant::now() >= self.at
    }

    /// Timeout for one blocking read: the poll interval, cut short by the deadline
    pub fn poll_timeout(&self, poll_interval: Duration) -> Duration {
        poll_interval.min(self.remaining())
    }
}
