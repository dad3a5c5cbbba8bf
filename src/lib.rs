//! m3combi - Korg M3 combination copy tool
//!
//! Talks to a Korg M3 workstation over MIDI System-Exclusive: builds framed
//! commands, sends them, and collects the asynchronous (possibly multi-packet)
//! replies through a receive state machine so callers can treat each exchange
//! as a single blocking call.

pub mod cli;
pub mod config;
pub mod device;
pub mod event;
pub mod midi;
pub mod registry;
pub mod session;
pub mod sysex;
pub mod workflow;
