//! E2E tests for trigger gating
//!
//! Off / Single / Continuous transitions against the running loop, including
//! the flush that has to precede the first read after an idle gate.

use std::sync::Arc;
use std::time::{Duration, Instant};
use usbscope::device::sim::{DeviceEvent, ScriptedRead, SimConfig, SimulatedDevice};
use usbscope::{Acquisition, ArmMode, ScopeConfig};

fn fast_device() -> Arc<SimulatedDevice> {
    Arc::new(SimulatedDevice::new(SimConfig {
        capacity: 64,
        fill_time: Duration::from_millis(1),
        ..Default::default()
    }))
}

fn config(mode: ArmMode) -> ScopeConfig {
    ScopeConfig {
        poll_interval_ms: 1,
        initial_mode: mode,
        ..Default::default()
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_off_gate_publishes_nothing_then_flushes_once() {
    let device = fast_device();
    let acq = Acquisition::start(device.clone(), &config(ArmMode::Off)).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(acq.stats().published, 0);
    assert!(acq.take_data().is_none());
    assert!(device.events().is_empty(), "device touched while gate off");

    acq.post_trigger_mode(ArmMode::Continuous);
    acq.data_ready()
        .recv_timeout(Duration::from_secs(5))
        .expect("publishing resumes");

    let events = device.events();
    assert_eq!(events[0], DeviceEvent::Flush);
    assert!(matches!(events[1], DeviceEvent::Schedule { .. }));
    assert_eq!(device.flush_count(), 1);

    wait_for("several frames", || acq.stats().published >= 3);
}

#[test]
fn test_single_fires_once() {
    let device = fast_device();
    let acq = Acquisition::start(device.clone(), &config(ArmMode::Single)).unwrap();

    acq.data_ready()
        .recv_timeout(Duration::from_secs(5))
        .expect("single capture published");
    assert!(acq.take_data().is_some());
    assert_eq!(acq.trigger_mode(), ArmMode::Off);

    // Nothing more arrives until re-armed
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(acq.stats().published, 1);
    assert!(acq.take_data().is_none());
    assert_eq!(device.schedule_count(), 1);
}

#[test]
fn test_single_then_continuous_resumes_without_manual_reschedule() {
    let device = fast_device();
    let acq = Acquisition::start(device.clone(), &config(ArmMode::Single)).unwrap();

    wait_for("single capture", || acq.stats().published == 1);
    wait_for("gate disarm", || acq.trigger_mode() == ArmMode::Off);
    drop(acq.take_data());

    assert_eq!(acq.post_trigger_mode(ArmMode::Continuous), ArmMode::Off);
    wait_for("continuous frames", || acq.stats().published >= 4);

    // The idle gate forced exactly one flush before re-arming
    assert_eq!(device.flush_count(), 1);
    assert_eq!(acq.trigger_mode(), ArmMode::Continuous);
}

#[test]
fn test_rearm_single_captures_again() {
    let device = fast_device();
    let acq = Acquisition::start(device, &config(ArmMode::Single)).unwrap();

    wait_for("first capture", || acq.stats().published == 1);
    wait_for("gate disarm", || acq.trigger_mode() == ArmMode::Off);

    acq.post_trigger_mode(ArmMode::Single);
    wait_for("second capture", || acq.stats().published == 2);
    wait_for("gate disarm", || acq.trigger_mode() == ArmMode::Off);

    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(acq.stats().published, 2);
}

#[test]
fn test_disarm_stops_publishing() {
    let device = fast_device();
    let acq = Acquisition::start(device, &config(ArmMode::Continuous)).unwrap();
    wait_for("frames", || acq.stats().published >= 2);

    acq.post_trigger_mode(ArmMode::Off);
    // Anything published before the disarm is already in the mailbox
    drop(acq.take_data());

    std::thread::sleep(Duration::from_millis(50));
    assert!(acq.take_data().is_none());
    assert_eq!(acq.trigger_mode(), ArmMode::Off);
    assert!(acq.is_running());
}

#[test]
fn test_disarm_between_completion_and_publish_discards_frame() {
    let device = fast_device();
    // The reschedule right after the first completion stalls, holding the
    // loop between the completion and the publish decision
    device.push_script([
        ScriptedRead::Data,
        ScriptedRead::SlowSchedule(Duration::from_millis(300)),
    ]);
    let acq = Acquisition::start(device.clone(), &config(ArmMode::Continuous)).unwrap();

    wait_for("stalled reschedule", || device.schedule_count() == 2);
    assert_eq!(device.frames_delivered(), 1);
    assert_eq!(acq.stats().cycles, 0);
    acq.post_trigger_mode(ArmMode::Off);

    // Both reads (the stalled one lands under Off) end up discarded
    wait_for("both cycles", || acq.stats().cycles == 2);
    let stats = acq.stats();
    assert_eq!(stats.published, 0);
    assert_eq!(stats.discarded, 2);
    assert!(acq.take_data().is_none());
    assert!(acq.data_ready().try_recv().is_err());
    assert_eq!(acq.pool().available(), acq.pool().size());
}
