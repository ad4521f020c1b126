//! Per-channel sample storage
//!
//! A [`SampleBuffer`] holds one acquisition: for every channel an interleaved
//! `[x0, y0, x1, y1, ...]` curve of `2 * capacity` values, the overflow
//! header reported by the device, and per-channel mean and standard
//! deviation. The X half of each curve only changes when the pretrigger
//! count or the time scale changes.

use crate::device::SampleSize;

/// Parameters that define the X axis of a buffer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisParams {
    /// Index of the trigger sample (maps to x = 0)
    pub pre_trigger: usize,
    /// Time per sample in seconds (> 0)
    pub scale: f64,
}

impl AxisParams {
    /// X coordinate of sample `index`
    pub fn x(&self, index: usize) -> f64 {
        (index as f64 - self.pre_trigger as f64) * self.scale
    }
}

impl Default for AxisParams {
    fn default() -> Self {
        Self {
            pre_trigger: 0,
            scale: 1.0,
        }
    }
}

/// Fixed-capacity storage for one multi-channel acquisition
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    capacity: usize,
    /// Interleaved (x, y) pairs per channel
    curves: Vec<Vec<f64>>,
    axis: Option<AxisParams>,
    overflow_header: u16,
    mean: Vec<f64>,
    stddev: Vec<f64>,
    /// Number of X-axis recomputations performed
    x_recomputes: u64,
}

impl SampleBuffer {
    /// Allocate a buffer for `channels` channels of `capacity` samples
    pub fn new(capacity: usize, channels: usize) -> Self {
        Self {
            capacity,
            curves: vec![vec![0.0; 2 * capacity]; channels],
            axis: None,
            overflow_header: 0,
            mean: vec![0.0; channels],
            stddev: vec![0.0; channels],
            x_recomputes: 0,
        }
    }

    /// Samples per channel
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.curves.len()
    }

    /// X-axis parameters currently applied, if any
    pub fn axis(&self) -> Option<AxisParams> {
        self.axis
    }

    /// How many times the X axis has actually been recomputed
    pub fn x_recompute_count(&self) -> u64 {
        self.x_recomputes
    }

    /// Recompute the X axis if `params` differ from the applied ones
    ///
    /// Returns `true` if a recomputation took place.
    pub fn update_x(&mut self, params: AxisParams) -> bool {
        if self.axis == Some(params) {
            return false;
        }
        if let Some((first, rest)) = self.curves.split_first_mut() {
            for (i, x) in first.iter_mut().step_by(2).enumerate() {
                *x = params.x(i);
            }
            for curve in rest {
                for (dst, src) in curve.iter_mut().zip(first.iter()).step_by(2) {
                    *dst = *src;
                }
            }
        }
        self.axis = Some(params);
        self.x_recomputes += 1;
        true
    }

    /// Copy raw channel-interleaved device data into the Y half of the curves
    ///
    /// `raw` holds `capacity * channels` samples of `sample_size` bytes each.
    /// Missing trailing samples (short transfer) read as zero. Mean and
    /// (population) standard deviation are recomputed per channel.
    pub fn update_y(&mut self, raw: &[u8], sample_size: SampleSize, header: u16) {
        let channels = self.channels();
        let elsz = sample_size.bytes();

        for (ch, curve) in self.curves.iter_mut().enumerate() {
            let mut sum = 0.0;
            let mut sum_sq = 0.0;
            for (i, y) in curve.iter_mut().skip(1).step_by(2).enumerate() {
                let offset = (i * channels + ch) * elsz;
                let value = raw
                    .get(offset..offset + elsz)
                    .map(|b| sample_size.decode(b))
                    .unwrap_or(0.0);
                *y = value;
                sum += value;
                sum_sq += value * value;
            }

            let n = self.capacity.max(1) as f64;
            let mean = sum / n;
            self.mean[ch] = mean;
            self.stddev[ch] = (sum_sq / n - mean * mean).max(0.0).sqrt();
        }

        self.overflow_header = header;
    }

    /// Interleaved `[x0, y0, x1, y1, ...]` data of one channel
    pub fn curve(&self, channel: usize) -> &[f64] {
        &self.curves[channel]
    }

    /// Iterate over the `(x, y)` points of one channel
    pub fn points(&self, channel: usize) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.curves[channel].chunks_exact(2).map(|p| (p[0], p[1]))
    }

    /// Y values of one channel
    pub fn y_values(&self, channel: usize) -> impl Iterator<Item = f64> + '_ {
        self.curves[channel].iter().skip(1).step_by(2).copied()
    }

    /// Overflow bitmask (bit `i` set: channel `i` clipped)
    pub fn overflow_header(&self) -> u16 {
        self.overflow_header
    }

    /// True if `channel` clipped during this acquisition
    pub fn is_overflow(&self, channel: usize) -> bool {
        channel < 16 && self.overflow_header & (1 << channel) != 0
    }

    /// Mean of one channel
    pub fn mean(&self, channel: usize) -> f64 {
        self.mean[channel]
    }

    /// Population standard deviation of one channel
    pub fn stddev(&self, channel: usize) -> f64 {
        self.stddev[channel]
    }

    /// Per-channel summary for status displays
    pub fn frame(&self) -> DataFrame {
        DataFrame {
            samples: self.capacity,
            channels: (0..self.channels())
                .map(|ch| ChannelSummary {
                    mean: self.mean[ch],
                    stddev: self.stddev[ch],
                    overflow: self.is_overflow(ch),
                })
                .collect(),
        }
    }
}

/// Derived values of one channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSummary {
    pub mean: f64,
    pub stddev: f64,
    pub overflow: bool,
}

/// Summary of one acquisition, detached from the pool
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    /// Samples per channel
    pub samples: usize,
    pub channels: Vec<ChannelSummary>,
}

impl DataFrame {
    /// True if any channel clipped
    pub fn any_overflow(&self) -> bool {
        self.channels.iter().any(|c| c.overflow)
    }
}
