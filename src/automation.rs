//! Visual sampling and UI interaction seams.
//!
//! The monitor app's power state is only visible as the color of its power
//! button, and the only way to change it is to click that button. Both
//! operations go through these traits so the power state machine can be
//! exercised against scripted implementations.

use crate::errors::PowerError;

/// An RGB screen sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Absolute screen coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenPoint {
    pub x: i32,
    pub y: i32,
}

/// Square patch around a center point; the sampler reduces the
/// `(2*radius+1)^2` pixels to one color (median per channel) so a stray
/// antialiased pixel cannot flip the classification.
#[derive(Debug, Clone, Copy)]
pub struct SampleRegion {
    pub center: ScreenPoint,
    pub radius: i32,
}

/// Synchronous, side-effect-free screen sampling.
pub trait VisualSampler: Send + Sync {
    fn sample(&self, region: SampleRegion) -> Result<Color, PowerError>;
}

/// UI actions the bridge can synthesize.
#[derive(Debug, Clone, Copy)]
pub enum UiAction {
    Click(ScreenPoint),
}

/// Synchronous UI interaction (mouse/keyboard synthesis).
pub trait UiInteraction: Send + Sync {
    fn invoke(&self, action: UiAction) -> Result<(), PowerError>;
}
