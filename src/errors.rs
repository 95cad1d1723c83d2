//! Error taxonomy.
//!
//! Transient conditions (device hiccups, a single ambiguous sample, one
//! failed write) are absorbed locally by the task that hit them; these
//! types cover the conditions that cross a seam or must reach an operator.

use crate::state::{PowerState, PowerTarget};
use std::path::PathBuf;
use thiserror::Error;

/// Failures of the physical knob.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device is unplugged or the handle went bad. Recovered by the
    /// pipeline's reopen loop, never fatal.
    #[error("knob unavailable: {0}")]
    Unavailable(String),
}

/// Failures of the control channel to the monitor app.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no control-channel port matching '{0}'")]
    PortNotFound(String),

    #[error("control-channel write failed: {0}")]
    WriteFailed(String),

    #[error("control-channel reconnect failed: {0}")]
    Reconnect(String),
}

/// Failures of visual power reconciliation.
#[derive(Debug, Error)]
pub enum PowerError {
    #[error("monitor app window not found")]
    WindowNotFound,

    /// The sampled color fell in the undefined band between the on and off
    /// signatures. Mapped to `PowerState::Unknown`, never guessed.
    #[error("power button color is ambiguous (r={r} g={g} b={b})")]
    Ambiguous { r: u8, g: u8, b: u8 },

    #[error("screen sampling failed: {0}")]
    Sampling(String),

    #[error("ui interaction failed: {0}")]
    Interaction(String),

    /// Verification never observed the desired state within the retry
    /// budget. The model's power is forced to `Unknown` before this is
    /// returned.
    #[error("failed to set power to {desired}; last observed state: {actual}")]
    StateChangeFailed {
        desired: PowerTarget,
        actual: PowerState,
    },
}

/// Failures of the external-process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Executable missing or the launch call failed. Fatal to the
    /// supervisor loop (it halts rather than retry-looping), but isolated
    /// from every other task.
    #[error("failed to launch '{path}': {reason}")]
    LaunchFailed { path: PathBuf, reason: String },
}
