//! Ping-pong scheduling of asynchronous device reads
//!
//! Two device-owned receive slots alternate: while the loop copies and
//! post-processes the slot that just completed, the device is already filling
//! the other one.
//!
//! The completion callback runs on a driver thread. It never touches sample
//! buffers; it records the header, lets the trigger gate account for the
//! capture and pushes a [`Completion`] through a channel. All data copying
//! happens on the loop thread after [`AsyncReadScheduler::wait_completion`]
//! returns.

use super::buffer::SampleBuffer;
use super::engine::AcquisitionError;
use super::gate::{ArmMode, TriggerGate};
use super::stop::StopSignal;
use crate::device::{AcquisitionDevice, DeviceSlot};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Number of receive slots
pub const SLOT_COUNT: usize = 2;

/// Result of one finished read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Data arrived
    Data { bytes: usize },
    /// The device timed out without data
    Timeout,
}

/// Completion event delivered to the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Slot that finished
    pub slot: usize,
    pub outcome: ReadOutcome,
    /// Overflow header of the slot
    pub header: u16,
    /// Gate mode in effect when the read finished
    pub mode: ArmMode,
}

impl Completion {
    /// True if the gate was armed when this read finished
    pub fn armed(&self) -> bool {
        self.mode.is_running()
    }
}

/// Raw message from the driver thread
#[derive(Debug, Clone, Copy)]
struct RawCompletion {
    slot: usize,
    result: isize,
    header: u16,
    mode: ArmMode,
}

#[derive(Debug)]
struct SlotTable {
    headers: [u16; SLOT_COUNT],
    next: usize,
    in_flight: bool,
}

/// Owner of the two receive slots and the completion channel
pub struct AsyncReadScheduler {
    device: Arc<dyn AcquisitionDevice>,
    gate: Arc<TriggerGate>,
    slots: [DeviceSlot; SLOT_COUNT],
    table: Arc<Mutex<SlotTable>>,
    completion_tx: Sender<RawCompletion>,
    completion_rx: Receiver<RawCompletion>,
    stop: StopSignal,
    timeout: Duration,
}

impl AsyncReadScheduler {
    /// Allocate both slots on `device`
    pub fn new(
        device: Arc<dyn AcquisitionDevice>,
        gate: Arc<TriggerGate>,
        stop: StopSignal,
        timeout: Duration,
    ) -> Self {
        let slots = [device.allocate_slot(), device.allocate_slot()];
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();

        Self {
            device,
            gate,
            slots,
            table: Arc::new(Mutex::new(SlotTable {
                headers: [0; SLOT_COUNT],
                // First schedule flips to slot 0
                next: SLOT_COUNT - 1,
                in_flight: false,
            })),
            completion_tx,
            completion_rx,
            stop,
            timeout,
        }
    }

    /// Flip to the other slot and start a read into it
    ///
    /// Returns the armed slot index. A rejected request is fatal.
    pub fn schedule_next(&self) -> Result<usize, AcquisitionError> {
        let slot = {
            let mut table = self.table.lock();
            table.next ^= 1;
            table.in_flight = true;
            table.next
        };

        let callback = self.completion_callback(slot);
        if !self
            .device
            .schedule_async_read(&self.slots[slot], callback, self.timeout)
        {
            self.table.lock().in_flight = false;
            tracing::error!(slot, "Device rejected async read");
            return Err(AcquisitionError::Scheduling { slot });
        }

        tracing::trace!(slot, "Async read scheduled");
        Ok(slot)
    }

    fn completion_callback(&self, slot: usize) -> crate::device::ReadCallback {
        let gate = Arc::clone(&self.gate);
        let table = Arc::clone(&self.table);
        let tx = self.completion_tx.clone();

        Box::new(move |result: isize, header: u16| {
            gate.complete_read(result > 0, |mode| {
                if result > 0 {
                    table.lock().headers[slot] = header;
                }
                let _ = tx.send(RawCompletion {
                    slot,
                    result,
                    header,
                    mode,
                });
            });
        })
    }

    /// Block until the outstanding read finishes or the stop signal fires
    ///
    /// Negative driver results are fatal; zero is a timeout.
    pub fn wait_completion(&self) -> Result<Completion, AcquisitionError> {
        let raw = crossbeam_channel::select! {
            recv(self.completion_rx) -> msg => msg.map_err(|_| AcquisitionError::Stopped)?,
            recv(self.stop.receiver()) -> _ => return Err(AcquisitionError::Stopped),
        };
        self.table.lock().in_flight = false;

        let outcome = match raw.result {
            r if r < 0 => {
                tracing::error!(slot = raw.slot, code = r, "Async read failed");
                return Err(AcquisitionError::DeviceRead {
                    slot: raw.slot,
                    code: r,
                });
            }
            0 => ReadOutcome::Timeout,
            r => ReadOutcome::Data { bytes: r as usize },
        };

        Ok(Completion {
            slot: raw.slot,
            outcome,
            header: raw.header,
            mode: raw.mode,
        })
    }

    /// Copy the contents of a completed slot into `buffer`
    pub fn copy_slot(&self, slot: usize, buffer: &mut SampleBuffer) {
        let header = self.header(slot);
        let sample_size = self.device.sample_size();
        self.slots[slot].with_data(|raw| buffer.update_y(raw, sample_size, header));
    }

    /// Last header recorded for `slot`
    pub fn header(&self, slot: usize) -> u16 {
        self.table.lock().headers[slot]
    }

    /// True while a read is outstanding
    pub fn in_flight(&self) -> bool {
        self.table.lock().in_flight
    }
}
