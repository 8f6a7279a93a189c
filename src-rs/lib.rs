//! Presence-driven scene-item visibility switching for OBS Studio.
//!
//! While OBS is reachable, frames of a monitored source are checked for a
//! human presence and, on every change, configured sources are shown or
//! hidden across all scenes over obs-websocket.

pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod lifecycle;
pub mod obs;
pub mod poll;
pub mod presence;
pub mod preview;
pub mod remote;
pub mod sync;

#[cfg(test)]
mod testing;
