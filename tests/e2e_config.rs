//! E2E tests for persistent configuration
//!
//! Tests config round-trip, defaults, backward compatibility, and that a
//! loaded config actually programs the device when acquisition starts.

use approx::assert_relative_eq;
use std::sync::Arc;
use std::time::Duration;
use usbscope::device::sim::{SimConfig, SimulatedDevice, SIM_ADC_CLOCK_HZ};
use usbscope::device::{AcquisitionDevice, Indicator, InputStage, TriggerEdge, TriggerSource};
use usbscope::{Acquisition, AcquisitionError, ArmMode, ScopeConfig};

fn device() -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::new(SimConfig {
        capacity: 128,
        fill_time: Duration::from_millis(1),
        ..Default::default()
    }))
}

#[test]
fn test_config_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("usbscope").join("config.json");

    let config = ScopeConfig {
        pool_size: 4,
        poll_interval_ms: 20,
        initial_mode: ArmMode::Single,
        decimation: Some(64),
        trigger_level_percent: Some(25.0),
        export_channel: 1,
        ..Default::default()
    };
    config.save(&path).unwrap();
    assert_eq!(ScopeConfig::load(&path), config);
}

#[test]
fn test_old_config_file_still_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"pool_size": 5, "unknown_field": true}"#).unwrap();

    let config = ScopeConfig::load(&path);
    assert_eq!(config.pool_size, 5);
    assert_eq!(config.poll_interval_ms, 100);
    assert_eq!(config.initial_mode, ArmMode::Continuous);
}

#[test]
fn test_start_programs_device() {
    let device = device();
    let config = ScopeConfig {
        initial_mode: ArmMode::Off,
        pre_trigger_samples: Some(40),
        decimation: Some(48),
        trigger_level_percent: Some(-10.0),
        ..Default::default()
    };
    let acq = Acquisition::start(device.clone(), &config).unwrap();

    assert_eq!(device.pre_trigger_samples(), 40);
    assert_eq!(device.decimation(), (16, 3));
    assert_relative_eq!(device.trigger_level_percent(), -10.0);

    let params = acq.params();
    assert_eq!(params.pre_trigger, 40);
    assert_relative_eq!(params.scale, 48.0 / SIM_ADC_CLOCK_HZ);
    assert_eq!(acq.trigger_mode(), ArmMode::Off);
}

#[test]
fn test_start_programs_front_end() {
    let device = device();
    let config = ScopeConfig {
        initial_mode: ArmMode::Off,
        trigger_source: Some(TriggerSource::External),
        trigger_edge: Some(TriggerEdge::Falling),
        auto_trigger: Some(false),
        attenuation_db: vec![3.0],
        input_stages: vec![InputStage {
            termination: true,
            ..Default::default()
        }],
        ..Default::default()
    };
    let _acq = Acquisition::start(device.clone(), &config).unwrap();

    assert_eq!(
        device.trigger_source(),
        (TriggerSource::External, TriggerEdge::Falling)
    );
    assert_eq!(device.auto_trigger_timeout_ms(), None);
    assert_relative_eq!(device.attenuation_db(0).unwrap(), 3.0);
    assert_relative_eq!(device.attenuation_db(1).unwrap(), 0.0);
    assert!(device.input_stage(0).unwrap().termination);
    assert!(!device.input_stage(1).unwrap().termination);
    assert!(device.indicator(Indicator::Termination(0)));
    assert!(!device.indicator(Indicator::Termination(1)));
}

#[test]
fn test_edge_alone_keeps_trigger_source() {
    let device = device();
    let config = ScopeConfig {
        initial_mode: ArmMode::Off,
        trigger_edge: Some(TriggerEdge::Falling),
        auto_trigger: Some(true),
        ..Default::default()
    };
    let _acq = Acquisition::start(device.clone(), &config).unwrap();
    assert_eq!(
        device.trigger_source(),
        (TriggerSource::ChannelA, TriggerEdge::Falling)
    );
    assert_eq!(device.auto_trigger_timeout_ms(), Some(100));
}

#[test]
fn test_runtime_pretrigger_change_follows_device() {
    let device = device();
    let config = ScopeConfig {
        initial_mode: ArmMode::Off,
        ..Default::default()
    };
    let acq = Acquisition::start(device.clone(), &config).unwrap();

    acq.set_pre_trigger_samples(100).unwrap();
    assert_eq!(device.pre_trigger_samples(), 100);
    assert_eq!(acq.params().pre_trigger, 100);

    // Out of range for a 128-sample buffer: neither side changes
    assert!(matches!(
        acq.set_pre_trigger_samples(128),
        Err(AcquisitionError::Device(_))
    ));
    assert_eq!(acq.params().pre_trigger, 100);
}

#[test]
fn test_invalid_settings_rejected_at_start() {
    let zero_timeout = ScopeConfig {
        read_timeout_ms: 0,
        ..Default::default()
    };
    assert!(matches!(
        Acquisition::start(device(), &zero_timeout),
        Err(AcquisitionError::InvalidConfig(_))
    ));

    let bad_level = ScopeConfig {
        trigger_level_percent: Some(150.0),
        ..Default::default()
    };
    assert!(matches!(
        Acquisition::start(device(), &bad_level),
        Err(AcquisitionError::Device(_))
    ));

    let bad_attenuation = ScopeConfig {
        attenuation_db: vec![0.0, 25.0],
        ..Default::default()
    };
    assert!(matches!(
        Acquisition::start(device(), &bad_attenuation),
        Err(AcquisitionError::Device(_))
    ));
}
