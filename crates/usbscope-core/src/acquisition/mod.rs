//! Acquisition pipeline
//!
//! This module contains the buffer flow between device and consumer:
//! - Per-channel sample storage ([`buffer`])
//! - Fixed pool of reference-counted buffers ([`pool`])
//! - Scoped extra ownership for exports ([`scoped`])
//! - Off/Single/Continuous trigger gate ([`gate`])
//! - Ping-pong async read scheduling ([`scheduler`])
//! - Single-occupant hand-off to the consumer ([`mailbox`])
//! - The loop thread and its handle ([`engine`])

pub mod buffer;
pub mod engine;
pub mod gate;
pub mod mailbox;
pub mod pacing;
pub mod pool;
pub mod scheduler;
pub mod scoped;
pub mod stop;
