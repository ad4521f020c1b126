//! UsbScope - USB oscilloscope acquisition
//!
//! This library re-exports the acquisition pipeline, device collaborator,
//! export and statistics functionality from `usbscope-core`.

pub use usbscope_core::acquisition;
pub use usbscope_core::config;
pub use usbscope_core::device;
pub use usbscope_core::export;
pub use usbscope_core::stats;

pub use usbscope_core::{
    Acquisition, AcquisitionError, AcquisitionStats, ArmMode, BufferPool, Columns, DataFrame,
    ScopeConfig, SimulatedDevice,
};
pub use usbscope_core::{BUILD_DATE, DEFAULT_POLL_INTERVAL_MS, DEFAULT_POOL_SIZE, VERSION};
