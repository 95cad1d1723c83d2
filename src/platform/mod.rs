//! Platform implementations of the automation and process-control seams.
//!
//! Only Windows is implemented: the monitor app this bridge was built for
//! only ships there. Other platforms still run the knob-to-MIDI path; the
//! bridge degrades by disabling supervision and power verification.

#[cfg(windows)]
pub mod windows;
