//! Acquisition counters and cycle-time history
//!
//! Keeps the recent cycle durations with automatic cleanup of old data and
//! the running totals the consumer polls for a status display.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Maximum number of cycle durations kept
const MAX_HISTORY_SIZE: usize = 3600; // 6 minutes at the default 100ms poll

/// A single measurement point
#[derive(Debug, Clone)]
pub struct Measurement {
    /// Timestamp of the measurement
    pub timestamp: DateTime<Utc>,
    /// Value of the measurement
    pub value: f64,
}

/// What a finished cycle did with its buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Buffer placed in the mailbox
    Published {
        /// An unclaimed frame was recycled to make room
        dropped: bool,
    },
    /// Data arrived while the gate was `Off`; buffer recycled
    Discarded,
    /// The device timed out; buffer recycled
    Timeout,
}

/// Running statistics calculated from cycles
#[derive(Debug, Default, Clone)]
pub struct RunningStats {
    /// Completed loop cycles
    pub cycles: u64,
    /// Frames placed in the mailbox
    pub published: u64,
    /// Frames recycled unread because a newer one replaced them
    pub dropped: u64,
    /// Frames recycled because the gate was off
    pub discarded: u64,
    /// Reads that ended without data
    pub timeouts: u64,
    /// Cycles that missed their pacing deadline
    pub overruns: u64,
    /// Most recent cycle time (ms)
    pub current_cycle_ms: f64,
    /// Minimum cycle time observed (ms)
    pub min_cycle_ms: f64,
    /// Maximum cycle time observed (ms)
    pub max_cycle_ms: f64,
    /// Average cycle time over the retained history (ms)
    pub avg_cycle_ms: f64,
    /// Time of the last published frame
    pub last_publish: Option<DateTime<Utc>>,
}

/// Statistics store for the acquisition loop
#[derive(Debug)]
pub struct AcquisitionStats {
    cycle_history: VecDeque<Measurement>,
    max_size: usize,
    stats: RunningStats,
}

impl AcquisitionStats {
    /// Create a new statistics store
    pub fn new() -> Self {
        Self::with_history(MAX_HISTORY_SIZE)
    }

    /// Create a store that retains at most `max_size` cycle durations
    pub fn with_history(max_size: usize) -> Self {
        Self {
            cycle_history: VecDeque::with_capacity(max_size.min(MAX_HISTORY_SIZE)),
            max_size: max_size.max(1),
            stats: RunningStats {
                min_cycle_ms: f64::MAX,
                ..Default::default()
            },
        }
    }

    /// Record one finished cycle
    ///
    /// # Arguments
    /// * `outcome` - What happened to the cycle's buffer
    /// * `duration_ms` - Time from buffer acquire to the end of processing
    pub fn record_cycle(&mut self, outcome: CycleOutcome, duration_ms: f64) {
        let now = Utc::now();

        if self.cycle_history.len() >= self.max_size {
            self.cycle_history.pop_front();
        }
        self.cycle_history.push_back(Measurement {
            timestamp: now,
            value: duration_ms,
        });

        match outcome {
            CycleOutcome::Published { dropped } => {
                self.stats.published += 1;
                self.stats.last_publish = Some(now);
                if dropped {
                    self.stats.dropped += 1;
                }
            }
            CycleOutcome::Discarded => self.stats.discarded += 1,
            CycleOutcome::Timeout => self.stats.timeouts += 1,
        }

        self.stats.cycles += 1;
        self.stats.current_cycle_ms = duration_ms;
        self.stats.min_cycle_ms = self.stats.min_cycle_ms.min(duration_ms);
        self.stats.max_cycle_ms = self.stats.max_cycle_ms.max(duration_ms);

        let sum: f64 = self.cycle_history.iter().map(|m| m.value).sum();
        self.stats.avg_cycle_ms = sum / self.cycle_history.len() as f64;
    }

    /// Record a cycle that missed its pacing deadline
    pub fn record_overrun(&mut self) {
        self.stats.overruns += 1;
    }

    /// Get cycle-time history
    pub fn cycle_history(&self) -> &VecDeque<Measurement> {
        &self.cycle_history
    }

    /// Get running statistics
    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }

    /// Last `count` cycle times as (seconds ago, ms) pairs, oldest first
    pub fn cycle_plot_data(&self, count: usize) -> Vec<(f64, f64)> {
        let now = Utc::now();
        let skip = self.cycle_history.len().saturating_sub(count);
        self.cycle_history
            .iter()
            .skip(skip)
            .map(|m| {
                let age = (now - m.timestamp).num_milliseconds() as f64 / 1000.0;
                (-age, m.value)
            })
            .collect()
    }
}

impl Default for AcquisitionStats {
    fn default() -> Self {
        Self::new()
    }
}
