//! Deadline-based cycle pacing
//!
//! Each cycle targets `deadline = previous deadline + interval`. A cycle that
//! overruns its deadline starts the next one immediately and re-bases the
//! deadline on the current time, so overload never turns into a burst of
//! catch-up cycles.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct Pacer {
    interval: Duration,
    deadline: Instant,
}

impl Pacer {
    /// First deadline is `now + interval`
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            deadline: now + interval,
        }
    }

    /// Restart the schedule at `now + interval`
    ///
    /// Used after the loop sat idle on a disarmed gate.
    pub fn rebase(&mut self, now: Instant) {
        self.deadline = now + self.interval;
    }

    /// Close the current cycle
    ///
    /// Returns how long to sleep before the next one, or `None` when the
    /// cycle overran its deadline.
    pub fn cycle_finished(&mut self, now: Instant) -> Option<Duration> {
        if now < self.deadline {
            let remaining = self.deadline - now;
            self.deadline += self.interval;
            Some(remaining)
        } else {
            self.deadline = now + self.interval;
            None
        }
    }
}
