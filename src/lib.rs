//! VolKnob GW - bridge a USB volume knob to a speaker manager application.
//!
//! The knob's rotation and button events become MIDI control-change messages
//! on the monitor app's control channel. Because the app exposes no readable
//! power state, power is reconciled by sampling the color of its power button
//! and clicking it when needed, and a supervisor keeps the app itself alive,
//! window-stable, and minimized.

pub mod accel;
pub mod api;
pub mod automation;
pub mod bridge;
pub mod command;
pub mod config;
pub mod device;
pub mod emitter;
pub mod errors;
pub mod logging;
pub mod midi;
pub mod pipeline;
pub mod platform;
pub mod power;
pub mod process;
pub mod proto;
pub mod retry;
pub mod state;
pub mod supervisor;
