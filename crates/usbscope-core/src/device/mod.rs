//! Sampling device collaborator
//!
//! The acquisition core never talks to the firmware directly. Everything it
//! needs from the hardware goes through [`AcquisitionDevice`]:
//! - geometry (buffer capacity, channel count, sample width)
//! - acquisition parameters (pretrigger count, decimation, trigger setup)
//! - analog front end (variable attenuator, input stage switches)
//! - front-panel indicators
//! - asynchronous reads into device-owned receive slots
//!
//! Completion callbacks are invoked on a thread owned by the driver, so the
//! callback type is `Send` and the slots are internally locked.

pub mod sim;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound of the first (CIC0) decimation stage
pub const MAX_STAGE0_DECIMATION: u32 = 16;

/// Upper bound of the second (CIC1) decimation stage
pub const MAX_STAGE1_DECIMATION: u32 = 1 << 12;

/// Auto-trigger timeout used when the auto trigger is switched on
pub const DEFAULT_AUTO_TRIGGER_MS: u32 = 100;

/// Errors reported by a device implementation
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("{0} not supported by this device")]
    Unsupported(&'static str),
}

/// Width of one raw sample as delivered by the ADC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleSize {
    /// Signed 8-bit samples
    OneByte,
    /// Signed 16-bit little-endian samples
    TwoBytes,
}

impl SampleSize {
    /// Number of bytes per sample
    pub fn bytes(self) -> usize {
        match self {
            Self::OneByte => 1,
            Self::TwoBytes => 2,
        }
    }

    /// Largest positive raw value
    pub fn full_scale(self) -> f64 {
        match self {
            Self::OneByte => i8::MAX as f64,
            Self::TwoBytes => i16::MAX as f64,
        }
    }

    /// Decode one raw sample starting at `bytes[0]`
    pub fn decode(self, bytes: &[u8]) -> f64 {
        match self {
            Self::OneByte => bytes[0] as i8 as f64,
            Self::TwoBytes => i16::from_le_bytes([bytes[0], bytes[1]]) as f64,
        }
    }

    /// Encode one raw sample into `out`, clamping to the representable range
    pub fn encode(self, value: f64, out: &mut [u8]) {
        match self {
            Self::OneByte => {
                let v = value.round().clamp(i8::MIN as f64, i8::MAX as f64) as i8;
                out[0] = v as u8;
            }
            Self::TwoBytes => {
                let v = value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
                out[..2].copy_from_slice(&v.to_le_bytes());
            }
        }
    }
}

/// Trigger source selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerSource {
    ChannelA,
    ChannelB,
    External,
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TriggerSource::ChannelA => "Channel A",
            TriggerSource::ChannelB => "Channel B",
            TriggerSource::External => "External",
        };
        f.write_str(name)
    }
}

impl FromStr for TriggerSource {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "cha" | "channel-a" => Ok(TriggerSource::ChannelA),
            "b" | "chb" | "channel-b" => Ok(TriggerSource::ChannelB),
            "ext" | "external" => Ok(TriggerSource::External),
            _ => Err(DeviceError::InvalidParameter(format!(
                "unknown trigger source {s}"
            ))),
        }
    }
}

/// Trigger edge selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerEdge {
    Rising,
    Falling,
}

impl FromStr for TriggerEdge {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rising" => Ok(TriggerEdge::Rising),
            "falling" => Ok(TriggerEdge::Falling),
            _ => Err(DeviceError::InvalidParameter(format!(
                "unknown trigger edge {s}"
            ))),
        }
    }
}

/// Front-end switches of one input channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputStage {
    /// 50 Ohm termination (otherwise 1 MOhm)
    pub termination: bool,
    /// DC coupling (otherwise AC)
    pub dc_coupled: bool,
    /// Fixed -20 dB attenuator in the signal path
    pub attenuator: bool,
}

impl Default for InputStage {
    fn default() -> Self {
        Self {
            termination: false,
            dc_coupled: true,
            attenuator: false,
        }
    }
}

/// Front-panel LEDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    /// A frame was captured since the trigger was last armed
    Trigger,
    /// The last frame clipped on this channel
    Overflow(usize),
    /// 50 Ohm termination active on this channel
    Termination(usize),
}

/// Device-owned receive memory for one asynchronous read
///
/// Cloning yields another handle to the same memory. The driver fills it from
/// its own thread; the acquisition loop copies it out after the completion
/// has been signalled.
#[derive(Clone)]
pub struct DeviceSlot {
    id: usize,
    data: Arc<Mutex<Vec<u8>>>,
}

impl DeviceSlot {
    /// Allocate a zeroed slot of `len` bytes
    pub fn new(id: usize, len: usize) -> Self {
        Self {
            id,
            data: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    /// Identifier assigned by the allocating device
    pub fn id(&self) -> usize {
        self.id
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// True if the slot holds no memory
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` with shared access to the raw bytes
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.lock();
        f(&data)
    }

    /// Run `f` with exclusive access to the raw bytes
    pub fn fill_with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock();
        f(&mut data)
    }
}

impl std::fmt::Debug for DeviceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSlot")
            .field("id", &self.id)
            .field("len", &self.len())
            .finish()
    }
}

/// Completion callback for [`AcquisitionDevice::schedule_async_read`]
///
/// Arguments are `(result, header)`: `result > 0` is the number of bytes
/// transferred, `0` a timeout, negative values a driver error code. `header`
/// carries one overflow bit per channel.
pub type ReadCallback = Box<dyn FnOnce(isize, u16) + Send + 'static>;

/// Hardware sampling device as seen by the acquisition core
pub trait AcquisitionDevice: Send + Sync {
    /// Human readable device name
    fn name(&self) -> &str;

    /// Samples per channel in one acquisition
    fn buffer_capacity(&self) -> usize;

    /// Number of input channels
    fn channel_count(&self) -> usize;

    /// Width of one raw sample
    fn sample_size(&self) -> SampleSize;

    /// ADC clock frequency in Hz
    fn adc_clock_hz(&self) -> f64;

    /// Samples retained ahead of the trigger point
    fn pre_trigger_samples(&self) -> usize;

    /// Set the pretrigger count (must be below the buffer capacity)
    fn set_pre_trigger_samples(&self, samples: usize) -> Result<(), DeviceError>;

    /// Decimation factors of the two cascaded filter stages
    fn decimation(&self) -> (u32, u32);

    /// Set the total decimation; the device splits it across its stages
    fn set_decimation(&self, decimation: u32) -> Result<(), DeviceError>;

    /// Trigger level in percent of full scale
    fn trigger_level_percent(&self) -> f64;

    /// Set the trigger level in percent of full scale (-100..=100)
    fn set_trigger_level_percent(&self, percent: f64) -> Result<(), DeviceError>;

    /// Current trigger source and edge
    fn trigger_source(&self) -> (TriggerSource, TriggerEdge);

    /// Select trigger source and edge
    fn set_trigger_source(&self, source: TriggerSource, edge: TriggerEdge)
        -> Result<(), DeviceError>;

    /// Auto-trigger timeout; `None` means the device waits for a real trigger
    fn auto_trigger_timeout_ms(&self) -> Option<u32>;

    /// Enable (`Some`) or disable (`None`) the auto trigger
    fn set_auto_trigger_timeout_ms(&self, timeout_ms: Option<u32>) -> Result<(), DeviceError>;

    /// Range of the variable-gain attenuator in dB; `None` if not fitted
    fn attenuation_range_db(&self) -> Option<(f64, f64)> {
        None
    }

    /// Current attenuation of `channel` in dB
    fn attenuation_db(&self, _channel: usize) -> Result<f64, DeviceError> {
        Err(DeviceError::Unsupported("variable attenuator"))
    }

    /// Set the attenuation of `channel` in dB
    fn set_attenuation_db(&self, _channel: usize, _db: f64) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("variable attenuator"))
    }

    /// Input stage switches of `channel`
    fn input_stage(&self, _channel: usize) -> Result<InputStage, DeviceError> {
        Err(DeviceError::Unsupported("input stage control"))
    }

    fn set_input_stage(&self, _channel: usize, _stage: InputStage) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("input stage control"))
    }

    /// Switch a front-panel LED; devices without LEDs ignore this
    fn set_indicator(&self, _indicator: Indicator, _on: bool) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Allocate a receive slot sized for one full acquisition
    fn allocate_slot(&self) -> DeviceSlot;

    /// Start a non-blocking read into `slot`
    ///
    /// Returns `false` if the request was rejected. `callback` is invoked
    /// exactly once, from a driver thread, when the read finishes.
    fn schedule_async_read(
        &self,
        slot: &DeviceSlot,
        callback: ReadCallback,
        timeout: Duration,
    ) -> bool;

    /// Discard samples the device accumulated while nobody was reading
    fn flush(&self) -> Result<(), DeviceError>;
}

/// Total decimation of the device (product of both stages)
pub fn effective_decimation(device: &dyn AcquisitionDevice) -> u32 {
    let (d0, d1) = device.decimation();
    d0 * d1
}

/// Time between two samples, in seconds
pub fn time_scale(device: &dyn AcquisitionDevice) -> f64 {
    effective_decimation(device) as f64 / device.adc_clock_hz()
}

/// Split a total decimation into `(stage0, stage1)`
///
/// Prefers the largest first stage that divides the total evenly while
/// keeping the second stage within range.
pub fn split_decimation(decimation: u32) -> Option<(u32, u32)> {
    if decimation == 0 || decimation > MAX_STAGE0_DECIMATION * MAX_STAGE1_DECIMATION {
        return None;
    }
    (1..=MAX_STAGE0_DECIMATION)
        .rev()
        .find(|d0| decimation % d0 == 0 && decimation / d0 <= MAX_STAGE1_DECIMATION)
        .map(|d0| (d0, decimation / d0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_size_round_trip_clamps() {
        let mut buf = [0u8; 2];
        SampleSize::OneByte.encode(300.0, &mut buf);
        assert_eq!(SampleSize::OneByte.decode(&buf), 127.0);

        SampleSize::TwoBytes.encode(-1234.4, &mut buf);
        assert_eq!(SampleSize::TwoBytes.decode(&buf), -1234.0);
        assert_eq!(buf, (-1234i16).to_le_bytes());
    }

    #[test]
    fn test_trigger_selection_parsing() {
        assert_eq!("a".parse::<TriggerSource>().unwrap(), TriggerSource::ChannelA);
        assert_eq!("Channel-B".parse::<TriggerSource>().unwrap(), TriggerSource::ChannelB);
        assert_eq!("ext".parse::<TriggerSource>().unwrap(), TriggerSource::External);
        assert!("c".parse::<TriggerSource>().is_err());
        assert_eq!("Falling".parse::<TriggerEdge>().unwrap(), TriggerEdge::Falling);
        assert!("up".parse::<TriggerEdge>().is_err());
        assert_eq!(TriggerSource::External.to_string(), "External");
    }

    #[test]
    fn test_input_stage_defaults_for_partial_json() {
        let stage: InputStage = serde_json::from_str(r#"{"termination": true}"#).unwrap();
        assert!(stage.termination);
        assert!(stage.dc_coupled);
        assert!(!stage.attenuator);
    }

    /// Device with no analog front end and no LEDs
    struct BareDevice;

    impl AcquisitionDevice for BareDevice {
        fn name(&self) -> &str {
            "bare"
        }
        fn buffer_capacity(&self) -> usize {
            16
        }
        fn channel_count(&self) -> usize {
            1
        }
        fn sample_size(&self) -> SampleSize {
            SampleSize::OneByte
        }
        fn adc_clock_hz(&self) -> f64 {
            1.0e6
        }
        fn pre_trigger_samples(&self) -> usize {
            0
        }
        fn set_pre_trigger_samples(&self, _samples: usize) -> Result<(), DeviceError> {
            Ok(())
        }
        fn decimation(&self) -> (u32, u32) {
            (4, 2)
        }
        fn set_decimation(&self, _decimation: u32) -> Result<(), DeviceError> {
            Ok(())
        }
        fn trigger_level_percent(&self) -> f64 {
            0.0
        }
        fn set_trigger_level_percent(&self, _percent: f64) -> Result<(), DeviceError> {
            Ok(())
        }
        fn trigger_source(&self) -> (TriggerSource, TriggerEdge) {
            (TriggerSource::ChannelA, TriggerEdge::Rising)
        }
        fn set_trigger_source(
            &self,
            _source: TriggerSource,
            _edge: TriggerEdge,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
        fn auto_trigger_timeout_ms(&self) -> Option<u32> {
            None
        }
        fn set_auto_trigger_timeout_ms(&self, _timeout_ms: Option<u32>) -> Result<(), DeviceError> {
            Ok(())
        }
        fn allocate_slot(&self) -> DeviceSlot {
            DeviceSlot::new(0, 16)
        }
        fn schedule_async_read(
            &self,
            _slot: &DeviceSlot,
            _callback: ReadCallback,
            _timeout: Duration,
        ) -> bool {
            false
        }
        fn flush(&self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    #[test]
    fn test_missing_front_end_reports_unsupported() {
        let device = BareDevice;
        assert_eq!(device.attenuation_range_db(), None);
        assert!(matches!(
            device.set_attenuation_db(0, 3.0),
            Err(DeviceError::Unsupported(_))
        ));
        assert!(matches!(
            device.input_stage(0),
            Err(DeviceError::Unsupported(_))
        ));
        // LEDs are optional
        assert!(device.set_indicator(Indicator::Trigger, true).is_ok());
        assert_eq!(effective_decimation(&device), 8);
        approx::assert_relative_eq!(time_scale(&device), 8.0e-6);
    }

    #[test]
    fn test_split_decimation() {
        assert_eq!(split_decimation(1), Some((1, 1)));
        assert_eq!(split_decimation(16), Some((16, 1)));
        assert_eq!(split_decimation(17), Some((1, 17)));
        assert_eq!(split_decimation(16 * 4096), Some((16, 4096)));
        assert_eq!(split_decimation(0), None);
        assert_eq!(split_decimation(16 * 4096 + 1), None);
    }

    #[test]
    fn test_slot_access() {
        let slot = DeviceSlot::new(7, 4);
        assert_eq!(slot.id(), 7);
        assert_eq!(slot.len(), 4);
        slot.fill_with(|d| d[3] = 9);
        let clone = slot.clone();
        assert_eq!(clone.with_data(|d| d[3]), 9);
    }
}
