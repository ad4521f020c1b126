//! UsbScope Core - Acquisition pipeline for a two-channel USB oscilloscope
//!
//! This library moves sample buffers from an asynchronous sampling device to
//! a display or export consumer. A fixed pool of reference-counted buffers,
//! two ping-pong device slots and a trigger gate keep the device busy while
//! the consumer always sees the most recent complete acquisition.

pub mod acquisition;
pub mod config;
pub mod device;
pub mod export;
pub mod stats;

pub use acquisition::buffer::{AxisParams, DataFrame, SampleBuffer};
pub use acquisition::engine::{Acquisition, AcquisitionError, EngineState};
pub use acquisition::gate::{ArmMode, TriggerGate};
pub use acquisition::pool::{BufferPool, PoolError, PooledBuffer};
pub use acquisition::scoped::{with_scoped_buffer, ScopedBuffer};
pub use config::ScopeConfig;
pub use device::{sim::SimulatedDevice, AcquisitionDevice, DeviceError};
pub use export::{Columns, ExportError};
pub use stats::store::AcquisitionStats;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default number of pooled sample buffers
pub const DEFAULT_POOL_SIZE: usize = 3;

/// Default loop period (ms)
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default timeout of one async device read (ms)
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;

/// Number of ping-pong receive slots
pub const SLOT_COUNT: usize = acquisition::scheduler::SLOT_COUNT;
