//! Statistics storage
//!
//! Counters and cycle-time history of the acquisition loop, polled by the
//! consumer for status display.

pub mod store;
