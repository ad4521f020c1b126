//! Trigger arm state machine
//!
//! ```text
//!            post_mode(Single|Continuous)
//!   Off ─────────────────────────────────▶ Single / Continuous
//!    ▲                                         │
//!    ├── first successful read (Single) ───────┤
//!    └── post_mode(Off) ───────────────────────┘
//! ```
//!
//! Every transition goes through one lock, whether it comes from the
//! consumer, the acquisition loop or the driver's completion thread.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Trigger arm mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArmMode {
    /// Idle: nothing is published
    Off,
    /// Capture one buffer, then fall back to `Off`
    Single,
    /// Free-run
    #[default]
    Continuous,
}

impl ArmMode {
    /// True for `Single` and `Continuous`
    pub fn is_running(self) -> bool {
        self != ArmMode::Off
    }
}

impl fmt::Display for ArmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArmMode::Off => "Off",
            ArmMode::Single => "Single",
            ArmMode::Continuous => "Continuous",
        };
        f.write_str(name)
    }
}

impl FromStr for ArmMode {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(ArmMode::Off),
            "single" => Ok(ArmMode::Single),
            "continuous" => Ok(ArmMode::Continuous),
            _ => Err(GateError::UnknownMode(s.to_string())),
        }
    }
}

/// Errors raised by the trigger gate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Trigger gate stopped")]
    Stopped,

    #[error("Unknown trigger mode: {0}")]
    UnknownMode(String),
}

#[derive(Debug)]
struct GateState {
    mode: ArmMode,
    /// Set whenever the gate enters `Off`, cleared by the next wait
    idled: bool,
    /// A `Single` capture disarmed the gate and has not been published yet
    pending_capture: bool,
    stopped: bool,
}

/// Off / Single / Continuous gate shared by consumer, loop and driver thread
#[derive(Debug)]
pub struct TriggerGate {
    state: Mutex<GateState>,
    armed: Condvar,
}

impl TriggerGate {
    /// Create a gate in `mode`
    pub fn new(mode: ArmMode) -> Self {
        Self {
            state: Mutex::new(GateState {
                mode,
                idled: !mode.is_running(),
                pending_capture: false,
                stopped: false,
            }),
            armed: Condvar::new(),
        }
    }

    /// Current mode
    pub fn mode(&self) -> ArmMode {
        self.state.lock().mode
    }

    /// Non-blocking check: `mode != Off`
    pub fn is_running(&self) -> bool {
        self.state.lock().mode.is_running()
    }

    /// Set the mode; leaving `Off` wakes the waiting loop
    ///
    /// Returns the previous mode. Reads already in flight are left alone,
    /// but once `Off` is posted none of them is published, including a
    /// `Single` capture that fired and has not gone out yet.
    pub fn post_mode(&self, mode: ArmMode) -> ArmMode {
        let mut state = self.state.lock();
        let previous = state.mode;
        state.mode = mode;
        if !mode.is_running() {
            state.idled = true;
            state.pending_capture = false;
        }
        drop(state);

        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "Trigger mode changed");
        }
        if !previous.is_running() && mode.is_running() {
            self.armed.notify_one();
        }
        previous
    }

    /// Block while the gate is `Off`
    ///
    /// Returns `Ok(true)` if the gate was `Off` at some point since the
    /// previous call, even if it was re-armed before this one blocked. The
    /// device may then hold stale samples and needs a flush.
    pub fn wait_until_running(&self) -> Result<bool, GateError> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                return Err(GateError::Stopped);
            }
            if state.mode.is_running() {
                return Ok(std::mem::take(&mut state.idled));
            }
            self.armed.wait(&mut state);
        }
    }

    /// Account for a finished device read
    ///
    /// `f` runs under the gate lock and receives the mode in effect when the
    /// read completed. A successful read in `Single` then disarms the gate
    /// before the lock is released, so the loop can never observe `Single`
    /// for a capture that already fired.
    pub fn complete_read<R>(&self, success: bool, f: impl FnOnce(ArmMode) -> R) -> R {
        let mut state = self.state.lock();
        let mode = state.mode;
        let result = f(mode);
        if success && mode == ArmMode::Single {
            state.mode = ArmMode::Off;
            state.idled = true;
            state.pending_capture = true;
            tracing::debug!("Single capture fired, gate disarmed");
        }
        result
    }

    /// Publish a finished frame only if the gate still allows it
    ///
    /// `captured` is the mode the read completed under. The frame goes out
    /// if it was captured armed and the gate is either still running or was
    /// disarmed by this very `Single` capture. `publish` runs under the gate
    /// lock, so a concurrent `post_mode(Off)` lands entirely before or after
    /// it. Returns `None` when the frame has to be discarded.
    pub fn admit<R>(&self, captured: ArmMode, publish: impl FnOnce() -> R) -> Option<R> {
        let mut state = self.state.lock();
        let fired_single =
            captured == ArmMode::Single && std::mem::take(&mut state.pending_capture);
        if captured.is_running() && (state.mode.is_running() || fired_single) {
            Some(publish())
        } else {
            None
        }
    }

    /// Wake the waiting loop and make further waits fail
    pub fn stop(&self) {
        self.state.lock().stopped = true;
        self.armed.notify_all();
    }
}

impl Default for TriggerGate {
    fn default() -> Self {
        Self::new(ArmMode::default())
    }
}
