//! Acquisition loop and its consumer-facing handle
//!
//! One long-lived thread cycles through
//! `acquire buffer -> await completion -> reschedule -> process/publish -> pace`.
//! It blocks in exactly four places (pool acquire, completion wait, gate wait,
//! pacing sleep) and [`Acquisition::stop`] unblocks all of them.

use super::buffer::AxisParams;
use super::gate::{ArmMode, GateError, TriggerGate};
use super::mailbox::Mailbox;
use super::pacing::Pacer;
use super::pool::{BufferPool, PoolError, PooledBuffer};
use super::scheduler::{AsyncReadScheduler, ReadOutcome};
use super::stop::StopSignal;
use crate::config::ScopeConfig;
use crate::device::{
    time_scale, AcquisitionDevice, DeviceError, Indicator, InputStage, DEFAULT_AUTO_TRIGGER_MS,
};
use crate::stats::store::{AcquisitionStats, CycleOutcome, RunningStats};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use thiserror::Error;

/// Errors that end the acquisition loop
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Device rejected async read on slot {slot}")]
    Scheduling { slot: usize },

    #[error("Async read on slot {slot} failed with code {code}")]
    DeviceRead { slot: usize, code: isize },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Buffer pool error: {0}")]
    Pool(PoolError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Acquisition thread panicked")]
    Panicked,

    #[error("Acquisition stopped")]
    Stopped,
}

impl From<PoolError> for AcquisitionError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Shutdown => AcquisitionError::Stopped,
            other => AcquisitionError::Pool(other),
        }
    }
}

impl From<GateError> for AcquisitionError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Stopped => AcquisitionError::Stopped,
            GateError::UnknownMode(mode) => {
                AcquisitionError::InvalidParameter(format!("trigger mode {mode}"))
            }
        }
    }
}

/// Lifecycle of the loop thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Stopped,
    /// Ended by a fatal error
    Failed(String),
}

/// State shared between the loop and the consumer
#[derive(Debug)]
struct Shared {
    params: Mutex<AxisParams>,
    mailbox: Mailbox,
    stats: Mutex<AcquisitionStats>,
    state: Mutex<EngineState>,
}

/// The orchestrating loop; owned by the acquisition thread
pub struct AcquisitionLoop {
    device: Arc<dyn AcquisitionDevice>,
    pool: BufferPool,
    gate: Arc<TriggerGate>,
    scheduler: AsyncReadScheduler,
    shared: Arc<Shared>,
    data_ready: Sender<()>,
    stop: StopSignal,
    pacer: Pacer,
}

impl AcquisitionLoop {
    /// Run until stopped or a fatal error occurs
    ///
    /// `Err(Stopped)` is the normal way out.
    pub fn run(mut self) -> Result<(), AcquisitionError> {
        tracing::info!(device = self.device.name(), "Acquisition loop started");

        let result = self.run_cycles();

        let state = match &result {
            Err(AcquisitionError::Stopped) | Ok(()) => {
                tracing::info!("Acquisition loop stopped");
                EngineState::Stopped
            }
            Err(e) => {
                tracing::error!(error = %e, "Acquisition loop failed");
                EngineState::Failed(e.to_string())
            }
        };
        *self.shared.state.lock() = state;
        result
    }

    fn run_cycles(&mut self) -> Result<(), AcquisitionError> {
        if self.arm()? {
            self.pacer.rebase(Instant::now());
        }
        loop {
            self.cycle()?;
        }
    }

    /// Wait for the gate, flush if it was off, then start a read
    ///
    /// Returns `true` if the gate had been off, in which case the wait may
    /// have taken arbitrarily long.
    fn arm(&self) -> Result<bool, AcquisitionError> {
        let was_off = self.gate.wait_until_running()?;
        if self.stop.is_triggered() {
            return Err(AcquisitionError::Stopped);
        }
        if was_off {
            self.device.flush()?;
            tracing::debug!("Device flushed after idle gate");
        }
        self.scheduler.schedule_next()?;
        Ok(was_off)
    }

    fn cycle(&mut self) -> Result<(), AcquisitionError> {
        // Parameters are sampled once per cycle
        let params = *self.shared.params.lock();

        let buffer = self.pool.acquire()?;
        let started = Instant::now();

        let completion = self.scheduler.wait_completion()?;
        if self.gate.is_running() {
            self.scheduler.schedule_next()?;
        }

        let outcome = match completion.outcome {
            ReadOutcome::Data { bytes } if completion.armed() => {
                self.process(&buffer, completion.slot, params);
                let mailbox = &self.shared.mailbox;
                match self.gate.admit(completion.mode, || mailbox.publish(buffer)) {
                    Some(dropped) => {
                        let _ = self.data_ready.try_send(());
                        self.show_capture(completion.header);
                        tracing::debug!(slot = completion.slot, bytes, dropped, "Frame published");
                        CycleOutcome::Published { dropped }
                    }
                    None => {
                        tracing::debug!(slot = completion.slot, "Gate disarmed, frame discarded");
                        CycleOutcome::Discarded
                    }
                }
            }
            ReadOutcome::Data { .. } => {
                drop(buffer);
                tracing::debug!(slot = completion.slot, "Gate off, frame discarded");
                CycleOutcome::Discarded
            }
            ReadOutcome::Timeout => {
                drop(buffer);
                tracing::warn!(slot = completion.slot, "Device read timed out");
                CycleOutcome::Timeout
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.shared.stats.lock().record_cycle(outcome, elapsed_ms);

        if !self.scheduler.in_flight() && self.arm()? {
            // Time spent idle is not an overrun
            self.pacer.rebase(Instant::now());
            return Ok(());
        }

        match self.pacer.cycle_finished(Instant::now()) {
            Some(remaining) => {
                if self.stop.sleep(remaining) {
                    return Err(AcquisitionError::Stopped);
                }
            }
            None => {
                tracing::debug!("Cycle overran poll interval");
                self.shared.stats.lock().record_overrun();
            }
        }
        Ok(())
    }

    /// Light the trigger LED and mirror the overflow header on the panel
    fn show_capture(&self, header: u16) {
        let device = self.device.as_ref();
        for ch in 0..device.channel_count() {
            set_indicator(device, Indicator::Overflow(ch), header & (1 << ch) != 0);
        }
        set_indicator(device, Indicator::Trigger, true);
    }

    /// Copy a completed slot into `buffer` and refresh its derived data
    fn process(&self, buffer: &PooledBuffer, slot: usize, params: AxisParams) {
        let mut contents = buffer.write();
        self.scheduler.copy_slot(slot, &mut contents);
        if contents.update_x(params) {
            tracing::debug!(
                index = buffer.index(),
                pre_trigger = params.pre_trigger,
                scale = params.scale,
                "X axis recomputed"
            );
        }
    }
}

/// Front-panel feedback never stops the acquisition
fn set_indicator(device: &dyn AcquisitionDevice, indicator: Indicator, on: bool) {
    if let Err(e) = device.set_indicator(indicator, on) {
        tracing::warn!(?indicator, error = %e, "Failed to set indicator");
    }
}

/// Trigger and overflow LEDs go dark whenever the trigger is re-armed
fn clear_capture_indicators(device: &dyn AcquisitionDevice) {
    set_indicator(device, Indicator::Trigger, false);
    for ch in 0..device.channel_count() {
        set_indicator(device, Indicator::Overflow(ch), false);
    }
}

/// Handle to a running acquisition
///
/// Dropping the handle stops the loop.
pub struct Acquisition {
    device: Arc<dyn AcquisitionDevice>,
    pool: BufferPool,
    gate: Arc<TriggerGate>,
    shared: Arc<Shared>,
    data_ready: Receiver<()>,
    stop: StopSignal,
    thread: Option<JoinHandle<Result<(), AcquisitionError>>>,
}

impl Acquisition {
    /// Program the device from `config` and spawn the loop thread
    pub fn start(
        device: Arc<dyn AcquisitionDevice>,
        config: &ScopeConfig,
    ) -> Result<Self, AcquisitionError> {
        config
            .validate()
            .map_err(|e| AcquisitionError::InvalidConfig(e.to_string()))?;

        if let Some(samples) = config.pre_trigger_samples {
            device.set_pre_trigger_samples(samples)?;
        }
        if let Some(decimation) = config.decimation {
            device.set_decimation(decimation)?;
        }
        if let Some(level) = config.trigger_level_percent {
            device.set_trigger_level_percent(level)?;
        }
        if config.trigger_source.is_some() || config.trigger_edge.is_some() {
            let (source, edge) = device.trigger_source();
            device.set_trigger_source(
                config.trigger_source.unwrap_or(source),
                config.trigger_edge.unwrap_or(edge),
            )?;
        }
        if let Some(auto) = config.auto_trigger {
            device.set_auto_trigger_timeout_ms(auto.then_some(DEFAULT_AUTO_TRIGGER_MS))?;
        }
        for (ch, db) in config.attenuation_db.iter().enumerate() {
            device.set_attenuation_db(ch, *db)?;
        }
        for (ch, stage) in config.input_stages.iter().enumerate() {
            device.set_input_stage(ch, *stage)?;
        }
        for ch in 0..device.channel_count() {
            if let Ok(stage) = device.input_stage(ch) {
                set_indicator(device.as_ref(), Indicator::Termination(ch), stage.termination);
            }
        }
        clear_capture_indicators(device.as_ref());

        let pool = BufferPool::new(
            config.pool_size,
            device.buffer_capacity(),
            device.channel_count(),
        );
        let gate = Arc::new(TriggerGate::new(config.initial_mode));
        let stop = StopSignal::new();
        let shared = Arc::new(Shared {
            params: Mutex::new(AxisParams {
                pre_trigger: device.pre_trigger_samples(),
                scale: time_scale(device.as_ref()),
            }),
            mailbox: Mailbox::new(),
            stats: Mutex::new(AcquisitionStats::new()),
            state: Mutex::new(EngineState::Running),
        });
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let scheduler = AsyncReadScheduler::new(
            Arc::clone(&device),
            Arc::clone(&gate),
            stop.clone(),
            config.read_timeout(),
        );
        let acquisition_loop = AcquisitionLoop {
            device: Arc::clone(&device),
            pool: pool.clone(),
            gate: Arc::clone(&gate),
            scheduler,
            shared: Arc::clone(&shared),
            data_ready: ready_tx,
            stop: stop.clone(),
            pacer: Pacer::new(config.poll_interval(), Instant::now()),
        };

        let thread = std::thread::Builder::new()
            .name("acquisition".into())
            .spawn(move || acquisition_loop.run())
            .expect("Failed to spawn acquisition thread");

        tracing::info!(
            device = device.name(),
            pool_size = config.pool_size,
            mode = %config.initial_mode,
            interval_ms = config.poll_interval_ms,
            "Acquisition started"
        );

        Ok(Self {
            device,
            pool,
            gate,
            shared,
            data_ready: ready_rx,
            stop,
            thread: Some(thread),
        })
    }

    /// Update the X-axis parameters; the loop picks them up next cycle
    ///
    /// `None` keeps the current value. Returns the parameters now in effect.
    pub fn set_parms(
        &self,
        pre_trigger: Option<usize>,
        scale: Option<f64>,
    ) -> Result<AxisParams, AcquisitionError> {
        if let Some(s) = scale {
            if !(s.is_finite() && s > 0.0) {
                return Err(AcquisitionError::InvalidParameter(format!(
                    "scale must be positive, got {s}"
                )));
            }
        }

        let mut params = self.shared.params.lock();
        if let Some(p) = pre_trigger {
            params.pre_trigger = p;
        }
        if let Some(s) = scale {
            params.scale = s;
        }
        Ok(*params)
    }

    /// Parameters the next cycle will use
    pub fn params(&self) -> AxisParams {
        *self.shared.params.lock()
    }

    /// Program the device pretrigger count and follow it on the X axis
    pub fn set_pre_trigger_samples(&self, samples: usize) -> Result<(), AcquisitionError> {
        self.device.set_pre_trigger_samples(samples)?;
        self.set_parms(Some(samples), None)?;
        Ok(())
    }

    /// Program the device decimation and follow it on the X axis
    pub fn set_decimation(&self, decimation: u32) -> Result<(), AcquisitionError> {
        self.device.set_decimation(decimation)?;
        self.set_parms(None, Some(time_scale(self.device.as_ref())))?;
        Ok(())
    }

    /// Switch the input stage of `channel` and follow it on the termination LED
    pub fn set_input_stage(
        &self,
        channel: usize,
        stage: InputStage,
    ) -> Result<(), AcquisitionError> {
        self.device.set_input_stage(channel, stage)?;
        set_indicator(
            self.device.as_ref(),
            Indicator::Termination(channel),
            stage.termination,
        );
        Ok(())
    }

    /// Change the trigger mode; returns the previous one
    ///
    /// Every mode change clears the trigger and overflow indicators.
    pub fn post_trigger_mode(&self, mode: ArmMode) -> ArmMode {
        let previous = self.gate.post_mode(mode);
        clear_capture_indicators(self.device.as_ref());
        previous
    }

    pub fn trigger_mode(&self) -> ArmMode {
        self.gate.mode()
    }

    /// Fires (coalesced) whenever a frame is published
    pub fn data_ready(&self) -> &Receiver<()> {
        &self.data_ready
    }

    /// Take the latest published frame, if any
    pub fn take_data(&self) -> Option<PooledBuffer> {
        self.shared.mailbox.take()
    }

    /// Snapshot of the loop counters
    pub fn stats(&self) -> RunningStats {
        self.shared.stats.lock().stats().clone()
    }

    /// Last `count` cycle durations as (seconds ago, ms)
    pub fn cycle_plot_data(&self, count: usize) -> Vec<(f64, f64)> {
        self.shared.stats.lock().cycle_plot_data(count)
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn device(&self) -> &Arc<dyn AcquisitionDevice> {
        &self.device
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.lock().clone()
    }

    /// True while the loop thread is alive
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signal every blocking point and join the loop thread
    ///
    /// Returns the fatal error if the loop had already failed.
    pub fn stop(&mut self) -> Result<(), AcquisitionError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.stop.trigger();
        self.gate.stop();
        self.pool.shutdown();

        match thread.join() {
            Ok(Ok(())) | Ok(Err(AcquisitionError::Stopped)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::error!("Acquisition thread panicked");
                Err(AcquisitionError::Panicked)
            }
        }
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Acquisition ended with error");
        }
    }
}

impl std::fmt::Debug for Acquisition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acquisition")
            .field("device", &self.device.name())
            .field("mode", &self.gate.mode())
            .field("state", &self.state())
            .field("pool", &self.pool)
            .finish()
    }
}
