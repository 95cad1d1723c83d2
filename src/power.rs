//! Power state machine.
//!
//! The monitor app has no protocol-readable power state, so ground truth
//! comes from the color of its on-screen power button: dark grey when the
//! system is off, green when on, anything else unknown. Setting power
//! clicks the button and re-samples until the desired color appears.
//!
//! All sleeps in here are real thread sleeps; callers run `set_state` on a
//! blocking task.

use crate::automation::{Color, SampleRegion, ScreenPoint, UiAction, UiInteraction, VisualSampler};
use crate::errors::PowerError;
use crate::process::{ProcessControl, WindowId};
use crate::state::{PowerState, PowerTarget, StateModel};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Color thresholds separating the on/off signatures.
///
/// The gap between the two signatures is deliberate: a sample matching
/// neither is `Unknown`, never a guess. Values are calibrated per
/// deployment (button skin, scaling, color profile) via the config file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClassifyThresholds {
    /// OFF: every channel at or below this...
    #[serde(default = "default_off_max_brightness")]
    pub off_max_brightness: u8,
    /// ...and channels within this spread of each other (grey, not color).
    #[serde(default = "default_off_max_channel_spread")]
    pub off_max_channel_spread: u8,
    /// ON: green channel at least this bright...
    #[serde(default = "default_on_min_green")]
    pub on_min_green: u8,
    /// ...and exceeding red by at least this much.
    #[serde(default = "default_on_green_over_red")]
    pub on_green_over_red: u8,
}

fn default_off_max_brightness() -> u8 {
    95
}
fn default_off_max_channel_spread() -> u8 {
    22
}
fn default_on_min_green() -> u8 {
    110
}
fn default_on_green_over_red() -> u8 {
    35
}

impl Default for ClassifyThresholds {
    fn default() -> Self {
        Self {
            off_max_brightness: default_off_max_brightness(),
            off_max_channel_spread: default_off_max_channel_spread(),
            on_min_green: default_on_min_green(),
            on_green_over_red: default_on_green_over_red(),
        }
    }
}

/// Classify a sampled color into a power state.
pub fn classify(color: Color, t: &ClassifyThresholds) -> PowerState {
    let Color { r, g, b } = color;

    let max = r.max(g).max(b);
    let spread = max - r.min(g).min(b);
    if max <= t.off_max_brightness && spread <= t.off_max_channel_spread {
        return PowerState::Off;
    }

    if g >= t.on_min_green && g.saturating_sub(r) >= t.on_green_over_red {
        return PowerState::On;
    }

    PowerState::Unknown
}

/// Geometry and timing for the power button.
#[derive(Debug, Clone)]
pub struct PowerConfig {
    /// Button center, measured from the window's right edge.
    pub button_dx_from_right: i32,
    /// Button center, measured from the window's top edge.
    pub button_dy_from_top: i32,
    /// Sampling patch radius.
    pub patch_radius: i32,
    /// Wait after a click before the first verification sample.
    pub settle_delay: Duration,
    /// Total time to poll for the desired color after a click.
    pub verify_timeout: Duration,
    /// Poll interval during verification.
    pub verify_poll: Duration,
    /// Click retries after the first attempt fails verification.
    pub max_retries: u32,
    /// How long a cached window identity is trusted before re-lookup.
    pub window_cache_ttl: Duration,
    pub thresholds: ClassifyThresholds,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            button_dx_from_right: 28,
            button_dy_from_top: 80,
            patch_radius: 4,
            settle_delay: Duration::from_millis(350),
            verify_timeout: Duration::from_secs(3),
            verify_poll: Duration::from_millis(150),
            max_retries: 2,
            window_cache_ttl: Duration::from_secs(5),
            thresholds: ClassifyThresholds::default(),
        }
    }
}

struct CachedWindow {
    id: WindowId,
    cached_at: Instant,
}

/// Drives power transitions through sampling + clicking, committing every
/// outcome to the state model. Safe to share across tasks.
pub struct PowerStateMachine {
    control: Arc<dyn ProcessControl>,
    sampler: Arc<dyn VisualSampler>,
    ui: Arc<dyn UiInteraction>,
    model: StateModel,
    config: PowerConfig,
    process_name: String,
    window_cache: Mutex<Option<CachedWindow>>,
}

impl PowerStateMachine {
    pub fn new(
        control: Arc<dyn ProcessControl>,
        sampler: Arc<dyn VisualSampler>,
        ui: Arc<dyn UiInteraction>,
        model: StateModel,
        config: PowerConfig,
        process_name: String,
    ) -> Self {
        Self {
            control,
            sampler,
            ui,
            model,
            config,
            process_name,
            window_cache: Mutex::new(None),
        }
    }

    /// Drop the cached window identity. Called when the supervisor
    /// restarts the app: the old identity is guaranteed stale.
    pub fn invalidate_window(&self) {
        *self.window_cache.lock() = None;
        debug!("window identity cache invalidated");
    }

    /// Sample once and classify. Side-effect-free; safe from any thread.
    pub fn get_state(&self) -> Result<PowerState, PowerError> {
        let (state, color) = self.read_once()?;
        debug!(
            "power sample: {state} (r={} g={} b={})",
            color.r, color.g, color.b
        );
        Ok(state)
    }

    /// Drive power to `desired`, verifying visually. Idempotent: if the
    /// sampled state already matches, no UI interaction happens.
    ///
    /// On success the verified state is committed to the model; on any
    /// failure after the transition started, the model's power is forced
    /// to `Unknown` so nothing downstream trusts a stale value.
    pub fn set_state(&self, desired: PowerTarget) -> Result<(), PowerError> {
        let (current, color) = self.read_once()?;

        if current == desired.as_power_state() {
            debug!("power already {desired}");
            self.model.commit_power(current);
            return Ok(());
        }

        if current == PowerState::Unknown {
            // Clicking from an unknown state could toggle the wrong way;
            // refuse and leave the mirror unknown.
            self.model.commit_power(PowerState::Unknown);
            return Err(PowerError::Ambiguous {
                r: color.r,
                g: color.g,
                b: color.b,
            });
        }

        info!("setting power {current} -> {desired}");
        self.model.begin_power_transition(desired);
        match self.drive_transition(desired) {
            Ok(()) => {
                self.model.end_power_transition(desired.as_power_state());
                info!("power verified {desired}");
                Ok(())
            }
            Err(e) => {
                self.model.end_power_transition(PowerState::Unknown);
                Err(e)
            }
        }
    }

    fn drive_transition(&self, desired: PowerTarget) -> Result<(), PowerError> {
        let want = desired.as_power_state();

        for attempt in 0..=self.config.max_retries {
            let (state, color) = self.read_once()?;
            if state == want {
                return Ok(());
            }
            if state == PowerState::Unknown {
                // Lost track mid-transition; clicking blind could land on
                // the wrong side.
                return Err(PowerError::Ambiguous {
                    r: color.r,
                    g: color.g,
                    b: color.b,
                });
            }

            let region = self.button_region()?;
            debug!(
                "power attempt {attempt}: clicking ({}, {})",
                region.center.x, region.center.y
            );
            self.ui.invoke(UiAction::Click(region.center))?;

            std::thread::sleep(self.config.settle_delay);
            if self.wait_for(want) == want {
                return Ok(());
            }
            warn!("power attempt {attempt} did not verify, state still not {desired}");
        }

        let actual = self.read_once().map(|(s, _)| s).unwrap_or(PowerState::Unknown);
        Err(PowerError::StateChangeFailed { desired, actual })
    }

    /// Poll until the desired state appears or the verify window closes.
    fn wait_for(&self, desired: PowerState) -> PowerState {
        let deadline = Instant::now() + self.config.verify_timeout;
        let mut last = PowerState::Unknown;
        while Instant::now() < deadline {
            if let Ok((state, _)) = self.read_once() {
                last = state;
                if state == desired {
                    return state;
                }
            }
            std::thread::sleep(self.config.verify_poll);
        }
        last
    }

    fn read_once(&self) -> Result<(PowerState, Color), PowerError> {
        let region = self.button_region()?;
        let color = self.sampler.sample(region)?;
        Ok((classify(color, &self.config.thresholds), color))
    }

    /// Window lookup with a short-lived cache. The identity is revalidated
    /// (its rectangle must still resolve) before reuse; anything stale
    /// falls through to a fresh enumeration.
    fn window(&self) -> Result<WindowId, PowerError> {
        let mut cache = self.window_cache.lock();

        if let Some(cached) = cache.as_ref() {
            if cached.cached_at.elapsed() < self.config.window_cache_ttl
                && self.control.window_rect(cached.id).is_some()
            {
                return Ok(cached.id);
            }
            *cache = None;
        }

        let pid = self
            .control
            .find_by_name(&self.process_name)
            .ok_or(PowerError::WindowNotFound)?;
        let id = self
            .control
            .find_window(pid)
            .ok_or(PowerError::WindowNotFound)?;

        *cache = Some(CachedWindow {
            id,
            cached_at: Instant::now(),
        });
        Ok(id)
    }

    fn button_region(&self) -> Result<SampleRegion, PowerError> {
        let window = self.window()?;
        let rect = self
            .control
            .window_rect(window)
            .ok_or(PowerError::WindowNotFound)?;

        Ok(SampleRegion {
            center: ScreenPoint {
                x: rect.right - self.config.button_dx_from_right,
                y: rect.top + self.config.button_dy_from_top,
            },
            radius: self.config.patch_radius,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SupervisorError;
    use crate::process::{Pid, ProcessHandle, WindowRect};
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GREEN: Color = Color { r: 40, g: 180, b: 120 };
    const DARK: Color = Color { r: 60, g: 62, b: 58 };
    const GREY: Color = Color { r: 120, g: 120, b: 120 };

    /// Plays back a color script; the last color repeats forever.
    struct ScriptedSampler {
        script: Mutex<VecDeque<Color>>,
        last: Mutex<Color>,
    }

    impl ScriptedSampler {
        fn new(script: Vec<Color>) -> Self {
            let last = *script.last().unwrap_or(&GREY);
            Self {
                script: Mutex::new(script.into()),
                last: Mutex::new(last),
            }
        }
    }

    impl VisualSampler for ScriptedSampler {
        fn sample(&self, _region: SampleRegion) -> Result<Color, PowerError> {
            match self.script.lock().pop_front() {
                Some(c) => {
                    *self.last.lock() = c;
                    Ok(c)
                }
                None => Ok(*self.last.lock()),
            }
        }
    }

    struct CountingUi {
        clicks: AtomicUsize,
    }

    impl UiInteraction for CountingUi {
        fn invoke(&self, _action: UiAction) -> Result<(), PowerError> {
            self.clicks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// One process, one stable window.
    struct StaticControl;

    impl ProcessControl for StaticControl {
        fn find_by_name(&self, _name: &str) -> Option<Pid> {
            Some(4242)
        }
        fn is_running(&self, _pid: Pid) -> bool {
            true
        }
        fn is_responsive(&self, _pid: Pid) -> bool {
            true
        }
        fn launch(&self, path: &Path) -> Result<ProcessHandle, SupervisorError> {
            Err(SupervisorError::LaunchFailed {
                path: path.to_path_buf(),
                reason: "not supported in tests".into(),
            })
        }
        fn terminate(&self, _pid: Pid) {}
        fn find_window(&self, _pid: Pid) -> Option<WindowId> {
            Some(WindowId(0xA11CE))
        }
        fn window_rect(&self, _window: WindowId) -> Option<WindowRect> {
            Some(WindowRect {
                left: 100,
                top: 100,
                right: 900,
                bottom: 700,
            })
        }
        fn minimize(&self, _window: WindowId) -> bool {
            true
        }
    }

    fn machine(script: Vec<Color>) -> (PowerStateMachine, Arc<CountingUi>, StateModel) {
        let model = StateModel::new(64, Duration::from_millis(1), Duration::from_millis(1));
        let ui = Arc::new(CountingUi {
            clicks: AtomicUsize::new(0),
        });
        let config = PowerConfig {
            settle_delay: Duration::from_millis(1),
            verify_timeout: Duration::from_millis(20),
            verify_poll: Duration::from_millis(1),
            max_retries: 1,
            ..PowerConfig::default()
        };
        let m = PowerStateMachine::new(
            Arc::new(StaticControl),
            Arc::new(ScriptedSampler::new(script)),
            Arc::clone(&ui) as Arc<dyn UiInteraction>,
            model.clone(),
            config,
            "monitorapp".into(),
        );
        (m, ui, model)
    }

    #[test]
    fn classify_has_explicit_ambiguous_band() {
        let t = ClassifyThresholds::default();
        assert_eq!(classify(DARK, &t), PowerState::Off);
        assert_eq!(classify(GREEN, &t), PowerState::On);
        assert_eq!(classify(GREY, &t), PowerState::Unknown);
        // Bright but not green-dominant: unknown, not on.
        assert_eq!(
            classify(Color { r: 200, g: 210, b: 190 }, &t),
            PowerState::Unknown
        );
    }

    #[test]
    fn set_state_is_idempotent_with_zero_clicks() {
        let (m, ui, model) = machine(vec![GREEN]);
        m.set_state(PowerTarget::On).unwrap();
        assert_eq!(ui.clicks.load(Ordering::SeqCst), 0);
        assert_eq!(model.snapshot().power, PowerState::On);
    }

    #[test]
    fn set_state_clicks_and_verifies() {
        // Initial read: on. Attempt read: on. Post-click verify: off.
        let (m, ui, model) = machine(vec![GREEN, GREEN, DARK]);
        m.set_state(PowerTarget::Off).unwrap();
        assert_eq!(ui.clicks.load(Ordering::SeqCst), 1);
        assert_eq!(model.snapshot().power, PowerState::Off);
    }

    #[test]
    fn failed_verification_commits_unknown() {
        // Button stays green no matter how much we click.
        let (m, ui, model) = machine(vec![GREEN]);
        let err = m.set_state(PowerTarget::Off).unwrap_err();
        match err {
            PowerError::StateChangeFailed { desired, actual } => {
                assert_eq!(desired, PowerTarget::Off);
                assert_eq!(actual, PowerState::On);
            }
            other => panic!("unexpected error {other}"),
        }
        // Clicked on every attempt (initial + retries).
        assert_eq!(ui.clicks.load(Ordering::SeqCst), 2);
        // Never left stale: power is unknown, not the optimistic target.
        assert_eq!(model.snapshot().power, PowerState::Unknown);
    }

    #[test]
    fn on_then_off_never_leaves_stale_on() {
        let (m, _ui, model) = machine(vec![
            DARK, // set_state(On): initial read off
            DARK, // attempt read
            GREEN, // verify: on
            GREEN, // set_state(Off): initial read on
            GREEN, // attempt read
            DARK, // verify: off
        ]);
        m.set_state(PowerTarget::On).unwrap();
        m.set_state(PowerTarget::Off).unwrap();
        let power = model.snapshot().power;
        assert!(
            power == PowerState::Off || power == PowerState::Unknown,
            "power left as stale {power}"
        );
    }

    #[test]
    fn ambiguous_initial_state_refuses_to_click() {
        let (m, ui, model) = machine(vec![GREY]);
        let err = m.set_state(PowerTarget::On).unwrap_err();
        assert!(matches!(err, PowerError::Ambiguous { .. }));
        assert_eq!(ui.clicks.load(Ordering::SeqCst), 0);
        assert_eq!(model.snapshot().power, PowerState::Unknown);
    }

    #[test]
    fn get_state_maps_ambiguous_to_unknown() {
        let (m, _ui, _model) = machine(vec![GREY]);
        assert_eq!(m.get_state().unwrap(), PowerState::Unknown);
    }
}
