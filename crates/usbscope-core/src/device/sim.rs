//! Simulated sampling device
//!
//! Stands in for the USB scope when no hardware is attached. Reads are served
//! by a worker thread that sleeps for the configured fill time, writes a
//! two-channel test waveform into the slot and then invokes the completion
//! callback from that thread, just like the real driver.
//!
//! Tests can queue [`ScriptedRead`] outcomes and inspect the
//! [`DeviceEvent`] log to check the ordering of flushes and reads.

use super::{
    split_decimation, AcquisitionDevice, DeviceError, DeviceSlot, Indicator, InputStage,
    ReadCallback, SampleSize, TriggerEdge, TriggerSource, DEFAULT_AUTO_TRIGGER_MS,
};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// ADC clock used by the simulation (matches the reference board)
pub const SIM_ADC_CLOCK_HZ: f64 = 120.0e6;

/// Range of the simulated variable-gain attenuator, in dB
pub const SIM_ATTENUATION_RANGE_DB: (f64, f64) = (0.0, 20.0);

/// Outcome of one simulated read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedRead {
    /// Fill the slot and report success
    Data,
    /// Report a timeout (result 0)
    Timeout,
    /// Report a driver error with the given negative code
    Fail(isize),
    /// Refuse to schedule the read at all
    RejectSchedule,
    /// Hold the scheduling caller for the given time, then behave like `Data`
    SlowSchedule(Duration),
}

/// Calls observed by the simulated device, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Flush,
    Schedule { slot: usize },
}

/// Static configuration of a [`SimulatedDevice`]
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Samples per channel
    pub capacity: usize,
    /// Number of channels
    pub channels: usize,
    /// Raw sample width
    pub sample_size: SampleSize,
    /// Time the simulated hardware needs to fill one slot
    pub fill_time: Duration,
    /// Peak amplitude per channel as a fraction of full scale (> 1.0 clips)
    pub amplitude: Vec<f64>,
    /// Noise amplitude in raw counts
    pub noise: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            capacity: 16384,
            channels: 2,
            sample_size: SampleSize::OneByte,
            // 2 x 16k samples take roughly 50ms on the real link
            fill_time: Duration::from_millis(50),
            amplitude: vec![0.6, 0.3],
            noise: 1.0,
        }
    }
}

#[derive(Debug)]
struct Settings {
    pre_trigger: usize,
    decimation: (u32, u32),
    level_percent: f64,
    source: TriggerSource,
    edge: TriggerEdge,
    auto_timeout_ms: Option<u32>,
    amplitude: Vec<f64>,
    attenuation_db: Vec<f64>,
    input: Vec<InputStage>,
}

impl Settings {
    /// Linear gain of the analog front end of `channel`
    fn gain(&self, channel: usize) -> f64 {
        let fixed = if self.input[channel].attenuator { 20.0 } else { 0.0 };
        10f64.powf(-(self.attenuation_db[channel] + fixed) / 20.0)
    }
}

struct ReadRequest {
    slot: DeviceSlot,
    callback: ReadCallback,
    timeout: Duration,
    outcome: ScriptedRead,
}

/// State shared with the worker thread
struct Shared {
    config: SimConfig,
    settings: Mutex<Settings>,
    frames: AtomicUsize,
}

/// In-process stand-in for the USB scope
pub struct SimulatedDevice {
    shared: Arc<Shared>,
    script: Mutex<VecDeque<ScriptedRead>>,
    events: Mutex<Vec<DeviceEvent>>,
    indicators: Mutex<HashMap<Indicator, bool>>,
    next_slot_id: AtomicUsize,
    request_tx: crossbeam_channel::Sender<ReadRequest>,
}

impl SimulatedDevice {
    /// Create a device and start its worker thread
    pub fn new(config: SimConfig) -> Self {
        let mut amplitude = config.amplitude.clone();
        amplitude.resize(config.channels, 0.5);

        let shared = Arc::new(Shared {
            settings: Mutex::new(Settings {
                pre_trigger: config.capacity / 8,
                decimation: (1, 1),
                level_percent: 0.0,
                source: TriggerSource::ChannelA,
                edge: TriggerEdge::Rising,
                auto_timeout_ms: Some(DEFAULT_AUTO_TRIGGER_MS),
                attenuation_db: vec![0.0; config.channels],
                input: vec![InputStage::default(); config.channels],
                amplitude,
            }),
            config,
            frames: AtomicUsize::new(0),
        });

        let (request_tx, request_rx) = crossbeam_channel::unbounded::<ReadRequest>();
        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("sim-device".into())
            .spawn(move || {
                for request in request_rx {
                    worker.serve(request);
                }
                tracing::debug!("Simulated device worker exited");
            })
            .expect("Failed to spawn simulated device thread");

        tracing::info!(
            capacity = shared.config.capacity,
            channels = shared.config.channels,
            "Simulated device ready"
        );

        Self {
            shared,
            script: Mutex::new(VecDeque::new()),
            events: Mutex::new(Vec::new()),
            indicators: Mutex::new(HashMap::new()),
            next_slot_id: AtomicUsize::new(0),
            request_tx,
        }
    }

    /// Queue outcomes for upcoming reads; once exhausted every read succeeds
    pub fn push_script(&self, outcomes: impl IntoIterator<Item = ScriptedRead>) {
        self.script.lock().extend(outcomes);
    }

    /// Snapshot of the flush/schedule log
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    /// Number of `flush()` calls so far
    pub fn flush_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Flush))
            .count()
    }

    /// Number of accepted read requests so far
    pub fn schedule_count(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Schedule { .. }))
            .count()
    }

    /// Number of reads that delivered data
    pub fn frames_delivered(&self) -> usize {
        self.shared.frames.load(Ordering::Acquire)
    }

    /// Current state of a front-panel LED
    pub fn indicator(&self, indicator: Indicator) -> bool {
        self.indicators
            .lock()
            .get(&indicator)
            .copied()
            .unwrap_or(false)
    }

    fn check_channel(&self, channel: usize) -> Result<(), DeviceError> {
        if channel >= self.shared.config.channels {
            return Err(DeviceError::InvalidParameter(format!(
                "channel {} out of range (device has {})",
                channel, self.shared.config.channels
            )));
        }
        Ok(())
    }

    /// Change the simulated signal amplitude of one channel
    pub fn set_amplitude(&self, channel: usize, fraction: f64) {
        if let Some(a) = self.shared.settings.lock().amplitude.get_mut(channel) {
            *a = fraction;
        }
    }
}

impl Shared {
    fn serve(&self, request: ReadRequest) {
        let ReadRequest {
            slot,
            callback,
            timeout,
            outcome,
        } = request;

        if self.config.fill_time > timeout {
            std::thread::sleep(timeout);
            callback(0, 0);
            return;
        }
        std::thread::sleep(self.config.fill_time);

        match outcome {
            ScriptedRead::Data | ScriptedRead::SlowSchedule(_) => {
                let header = slot.fill_with(|data| self.render(data));
                let frame = self.frames.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(slot = slot.id(), frame, header, "Simulated read complete");
                callback(slot.len() as isize, header);
            }
            ScriptedRead::Timeout => callback(0, 0),
            ScriptedRead::Fail(code) => callback(code.min(-1), 0),
            ScriptedRead::RejectSchedule => {}
        }
    }

    /// Write one acquisition into `data`; returns the overflow header
    fn render(&self, data: &mut [u8]) -> u16 {
        let settings = self.settings.lock();
        let cfg = &self.config;
        let elsz = cfg.sample_size.bytes();
        let full_scale = cfg.sample_size.full_scale();
        let mut rng = rand::thread_rng();

        // Align the rising crossing of the trigger level with the pretrigger index
        let level = (settings.level_percent / 100.0).clamp(-1.0, 1.0);
        let periods = 4.0;
        let omega = 2.0 * PI * periods / cfg.capacity.max(1) as f64;
        let pre = settings.pre_trigger as f64;

        let mut header = 0u16;
        for i in 0..cfg.capacity {
            let t = i as f64 - pre;
            for ch in 0..cfg.channels {
                let amp = settings.amplitude[ch] * settings.gain(ch) * full_scale;
                let shape = match ch % 2 {
                    0 => (omega * t + level.asin()).sin(),
                    _ => {
                        if (omega * t).sin() >= 0.0 {
                            1.0
                        } else {
                            -1.0
                        }
                    }
                };
                let mut value = amp * shape + rng.gen_range(-cfg.noise..=cfg.noise);
                if value.abs() > full_scale {
                    value = value.clamp(-full_scale - 1.0, full_scale);
                    header |= 1 << ch;
                }
                let offset = (i * cfg.channels + ch) * elsz;
                if let Some(out) = data.get_mut(offset..offset + elsz) {
                    cfg.sample_size.encode(value, out);
                }
            }
        }
        header
    }
}

impl AcquisitionDevice for SimulatedDevice {
    fn name(&self) -> &str {
        "simulated"
    }

    fn buffer_capacity(&self) -> usize {
        self.shared.config.capacity
    }

    fn channel_count(&self) -> usize {
        self.shared.config.channels
    }

    fn sample_size(&self) -> SampleSize {
        self.shared.config.sample_size
    }

    fn adc_clock_hz(&self) -> f64 {
        SIM_ADC_CLOCK_HZ
    }

    fn pre_trigger_samples(&self) -> usize {
        self.shared.settings.lock().pre_trigger
    }

    fn set_pre_trigger_samples(&self, samples: usize) -> Result<(), DeviceError> {
        if samples >= self.shared.config.capacity {
            return Err(DeviceError::InvalidParameter(format!(
                "pretrigger count {} must be below buffer capacity {}",
                samples, self.shared.config.capacity
            )));
        }
        self.shared.settings.lock().pre_trigger = samples;
        Ok(())
    }

    fn decimation(&self) -> (u32, u32) {
        self.shared.settings.lock().decimation
    }

    fn set_decimation(&self, decimation: u32) -> Result<(), DeviceError> {
        let stages = split_decimation(decimation).ok_or_else(|| {
            DeviceError::InvalidParameter(format!("decimation {} out of range", decimation))
        })?;
        self.shared.settings.lock().decimation = stages;
        Ok(())
    }

    fn trigger_level_percent(&self) -> f64 {
        self.shared.settings.lock().level_percent
    }

    fn set_trigger_level_percent(&self, percent: f64) -> Result<(), DeviceError> {
        if !(-100.0..=100.0).contains(&percent) {
            return Err(DeviceError::InvalidParameter(format!(
                "trigger level {}% out of range",
                percent
            )));
        }
        self.shared.settings.lock().level_percent = percent;
        Ok(())
    }

    fn trigger_source(&self) -> (TriggerSource, TriggerEdge) {
        let s = self.shared.settings.lock();
        (s.source, s.edge)
    }

    fn set_trigger_source(
        &self,
        source: TriggerSource,
        edge: TriggerEdge,
    ) -> Result<(), DeviceError> {
        let mut s = self.shared.settings.lock();
        s.source = source;
        s.edge = edge;
        Ok(())
    }

    fn auto_trigger_timeout_ms(&self) -> Option<u32> {
        self.shared.settings.lock().auto_timeout_ms
    }

    fn set_auto_trigger_timeout_ms(&self, timeout_ms: Option<u32>) -> Result<(), DeviceError> {
        self.shared.settings.lock().auto_timeout_ms = timeout_ms;
        Ok(())
    }

    fn attenuation_range_db(&self) -> Option<(f64, f64)> {
        Some(SIM_ATTENUATION_RANGE_DB)
    }

    fn attenuation_db(&self, channel: usize) -> Result<f64, DeviceError> {
        self.check_channel(channel)?;
        Ok(self.shared.settings.lock().attenuation_db[channel])
    }

    fn set_attenuation_db(&self, channel: usize, db: f64) -> Result<(), DeviceError> {
        self.check_channel(channel)?;
        let (min, max) = SIM_ATTENUATION_RANGE_DB;
        if !(min..=max).contains(&db) {
            return Err(DeviceError::InvalidParameter(format!(
                "attenuation {} dB out of range ({}..{})",
                db, min, max
            )));
        }
        // The attenuator steps in quarter dB
        self.shared.settings.lock().attenuation_db[channel] = (db * 4.0).round() / 4.0;
        Ok(())
    }

    fn input_stage(&self, channel: usize) -> Result<InputStage, DeviceError> {
        self.check_channel(channel)?;
        Ok(self.shared.settings.lock().input[channel])
    }

    fn set_input_stage(&self, channel: usize, stage: InputStage) -> Result<(), DeviceError> {
        self.check_channel(channel)?;
        self.shared.settings.lock().input[channel] = stage;
        tracing::debug!(channel, ?stage, "Simulated input stage changed");
        Ok(())
    }

    fn set_indicator(&self, indicator: Indicator, on: bool) -> Result<(), DeviceError> {
        if let Indicator::Overflow(ch) | Indicator::Termination(ch) = indicator {
            self.check_channel(ch)?;
        }
        self.indicators.lock().insert(indicator, on);
        Ok(())
    }

    fn allocate_slot(&self) -> DeviceSlot {
        let cfg = &self.shared.config;
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        DeviceSlot::new(id, cfg.capacity * cfg.channels * cfg.sample_size.bytes())
    }

    fn schedule_async_read(
        &self,
        slot: &DeviceSlot,
        callback: ReadCallback,
        timeout: Duration,
    ) -> bool {
        let outcome = self.script.lock().pop_front().unwrap_or(ScriptedRead::Data);
        if outcome == ScriptedRead::RejectSchedule {
            tracing::warn!(slot = slot.id(), "Simulated device rejecting read");
            return false;
        }

        self.events
            .lock()
            .push(DeviceEvent::Schedule { slot: slot.id() });

        if let ScriptedRead::SlowSchedule(stall) = outcome {
            std::thread::sleep(stall);
        }

        self.request_tx
            .send(ReadRequest {
                slot: slot.clone(),
                callback,
                timeout,
                outcome,
            })
            .is_ok()
    }

    fn flush(&self) -> Result<(), DeviceError> {
        self.events.lock().push(DeviceEvent::Flush);
        tracing::debug!("Simulated device flushed");
        Ok(())
    }
}
