//! Configuration management.
//!
//! YAML file with serde defaults for everything except the ports the
//! bridge cannot guess (knob VID/PID, MIDI port pattern, app executable).

use crate::accel::AccelConfig;
use crate::command::CommandKind;
use crate::device::ButtonKey;
use crate::power::{ClassifyThresholds, PowerConfig};
use crate::supervisor::SupervisorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub midi: MidiConfig,
    #[serde(default)]
    pub accel: AccelConfig,
    #[serde(default)]
    pub power: PowerSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Commands older than this are dropped instead of replayed late.
    #[serde(default = "default_max_command_age_ms")]
    pub max_command_age_ms: u64,
    /// Absolute volume pushed once at startup; also seeds the mirror.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub startup_volume: Option<u8>,
    /// Power re-sampling period in seconds; 0 disables the poller.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
}

impl AppConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: AppConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn max_command_age(&self) -> Duration {
        Duration::from_millis(self.max_command_age_ms)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        match self.reconcile_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn default_queue_capacity() -> usize {
    100
}

fn default_max_command_age_ms() -> u64 {
    2000
}

fn default_reconcile_interval_secs() -> u64 {
    0
}

/// Physical knob configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// USB vendor id, e.g. 0x04d9.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u32,
    #[serde(default = "default_reopen_delay_ms")]
    pub reopen_delay_ms: u64,
    #[serde(default)]
    pub bindings: KnobBindings,
}

impl DeviceConfig {
    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }
}

fn default_read_timeout_ms() -> u32 {
    1000
}

fn default_reopen_delay_ms() -> u64 {
    2000
}

/// Which toggle a knob gesture fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GestureAction {
    Power,
    Mute,
    Dim,
    /// Explicitly unbound.
    None,
}

impl GestureAction {
    fn command(self) -> Option<CommandKind> {
        match self {
            GestureAction::Power => Some(CommandKind::PowerToggle),
            GestureAction::Mute => Some(CommandKind::MuteToggle),
            GestureAction::Dim => Some(CommandKind::DimToggle),
            GestureAction::None => None,
        }
    }
}

/// Gesture-to-action bindings for the knob's click surface.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KnobBindings {
    #[serde(default = "default_click_action")]
    pub click: GestureAction,
    #[serde(default = "default_dim_action")]
    pub double_click: GestureAction,
    #[serde(default = "default_dim_action")]
    pub triple_click: GestureAction,
    #[serde(default = "default_mute_action")]
    pub long_press: GestureAction,
}

fn default_click_action() -> GestureAction {
    GestureAction::Power
}

fn default_dim_action() -> GestureAction {
    GestureAction::Dim
}

fn default_mute_action() -> GestureAction {
    GestureAction::Mute
}

impl Default for KnobBindings {
    fn default() -> Self {
        Self {
            click: GestureAction::Power,
            double_click: GestureAction::Dim,
            triple_click: GestureAction::Dim,
            long_press: GestureAction::Mute,
        }
    }
}

impl KnobBindings {
    pub fn command_for(&self, key: ButtonKey) -> Option<CommandKind> {
        let action = match key {
            ButtonKey::Click => self.click,
            ButtonKey::DoubleClick => self.double_click,
            ButtonKey::TripleClick => self.triple_click,
            ButtonKey::LongPress => self.long_press,
        };
        action.command()
    }
}

/// Control channel (MIDI) configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MidiConfig {
    /// Output port, matched by case-insensitive substring.
    pub output_port: String,
    #[serde(default)]
    pub channel: u8,
    #[serde(default = "default_max_write_attempts")]
    pub max_write_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl MidiConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

fn default_max_write_attempts() -> u32 {
    3
}

fn default_reconnect_delay_ms() -> u64 {
    500
}

/// Power verification settings (serde view of [`PowerConfig`])
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PowerSettings {
    #[serde(default = "default_button_dx")]
    pub button_dx_from_right: i32,
    #[serde(default = "default_button_dy")]
    pub button_dy_from_top: i32,
    #[serde(default = "default_patch_radius")]
    pub patch_radius: i32,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    #[serde(default = "default_verify_poll_ms")]
    pub verify_poll_ms: u64,
    #[serde(default = "default_power_retries")]
    pub max_retries: u32,
    #[serde(default = "default_window_cache_ttl_secs")]
    pub window_cache_ttl_secs: u64,
    /// Block all commands this long after a power transition starts.
    #[serde(default = "default_settling_window_ms")]
    pub settling_window_ms: u64,
    /// Additionally block power commands this long after settling.
    #[serde(default = "default_cooldown_window_ms")]
    pub cooldown_window_ms: u64,
    #[serde(default)]
    pub thresholds: ClassifyThresholds,
}

fn default_button_dx() -> i32 {
    28
}
fn default_button_dy() -> i32 {
    80
}
fn default_patch_radius() -> i32 {
    4
}
fn default_settle_delay_ms() -> u64 {
    350
}
fn default_verify_timeout_ms() -> u64 {
    3000
}
fn default_verify_poll_ms() -> u64 {
    150
}
fn default_power_retries() -> u32 {
    2
}
fn default_window_cache_ttl_secs() -> u64 {
    5
}
fn default_settling_window_ms() -> u64 {
    2000
}
fn default_cooldown_window_ms() -> u64 {
    5000
}

impl Default for PowerSettings {
    fn default() -> Self {
        Self {
            button_dx_from_right: default_button_dx(),
            button_dy_from_top: default_button_dy(),
            patch_radius: default_patch_radius(),
            settle_delay_ms: default_settle_delay_ms(),
            verify_timeout_ms: default_verify_timeout_ms(),
            verify_poll_ms: default_verify_poll_ms(),
            max_retries: default_power_retries(),
            window_cache_ttl_secs: default_window_cache_ttl_secs(),
            settling_window_ms: default_settling_window_ms(),
            cooldown_window_ms: default_cooldown_window_ms(),
            thresholds: ClassifyThresholds::default(),
        }
    }
}

impl PowerSettings {
    pub fn settling_window(&self) -> Duration {
        Duration::from_millis(self.settling_window_ms)
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_millis(self.cooldown_window_ms)
    }

    pub fn to_config(&self) -> PowerConfig {
        PowerConfig {
            button_dx_from_right: self.button_dx_from_right,
            button_dy_from_top: self.button_dy_from_top,
            patch_radius: self.patch_radius,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
            verify_timeout: Duration::from_millis(self.verify_timeout_ms),
            verify_poll: Duration::from_millis(self.verify_poll_ms),
            max_retries: self.max_retries,
            window_cache_ttl: Duration::from_secs(self.window_cache_ttl_secs),
            thresholds: self.thresholds,
        }
    }
}

/// Supervisor settings (serde view of [`SupervisorConfig`])
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub executable: PathBuf,
    #[serde(default = "default_process_name")]
    pub process_name: String,
    #[serde(default = "default_cpu_threshold")]
    pub startup_cpu_threshold: f32,
    #[serde(default = "default_startup_poll_secs")]
    pub startup_poll_secs: u64,
    #[serde(default = "default_max_startup_wait_secs")]
    pub max_startup_wait_secs: u64,
    #[serde(default = "default_post_launch_settle_secs")]
    pub post_launch_settle_secs: u64,
    #[serde(default = "default_window_stability_count")]
    pub window_stability_count: u32,
    #[serde(default = "default_stabilize_poll_secs")]
    pub stabilize_poll_secs: u64,
    #[serde(default = "default_max_stabilize_wait_secs")]
    pub max_stabilize_wait_secs: u64,
    #[serde(default = "default_responsiveness_poll_secs")]
    pub responsiveness_poll_secs: u64,
    #[serde(default = "default_max_unresponsive_polls")]
    pub max_unresponsive_polls: u32,
    #[serde(default = "default_restart_delay_secs")]
    pub restart_delay_secs: u64,
}

fn default_process_name() -> String {
    "GLMv5".to_string()
}
fn default_cpu_threshold() -> f32 {
    2.0
}
fn default_startup_poll_secs() -> u64 {
    5
}
fn default_max_startup_wait_secs() -> u64 {
    300
}
fn default_post_launch_settle_secs() -> u64 {
    5
}
fn default_window_stability_count() -> u32 {
    4
}
fn default_stabilize_poll_secs() -> u64 {
    1
}
fn default_max_stabilize_wait_secs() -> u64 {
    60
}
fn default_responsiveness_poll_secs() -> u64 {
    5
}
fn default_max_unresponsive_polls() -> u32 {
    6
}
fn default_restart_delay_secs() -> u64 {
    5
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            executable: PathBuf::new(),
            process_name: default_process_name(),
            startup_cpu_threshold: default_cpu_threshold(),
            startup_poll_secs: default_startup_poll_secs(),
            max_startup_wait_secs: default_max_startup_wait_secs(),
            post_launch_settle_secs: default_post_launch_settle_secs(),
            window_stability_count: default_window_stability_count(),
            stabilize_poll_secs: default_stabilize_poll_secs(),
            max_stabilize_wait_secs: default_max_stabilize_wait_secs(),
            responsiveness_poll_secs: default_responsiveness_poll_secs(),
            max_unresponsive_polls: default_max_unresponsive_polls(),
            restart_delay_secs: default_restart_delay_secs(),
        }
    }
}

impl SupervisorSettings {
    pub fn to_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            executable: self.executable.clone(),
            process_name: self.process_name.clone(),
            startup_cpu_threshold: self.startup_cpu_threshold,
            startup_poll_interval: Duration::from_secs(self.startup_poll_secs),
            max_startup_wait: Duration::from_secs(self.max_startup_wait_secs),
            post_launch_settle: Duration::from_secs(self.post_launch_settle_secs),
            window_stability_count: self.window_stability_count,
            stabilize_poll_interval: Duration::from_secs(self.stabilize_poll_secs),
            max_stabilize_wait: Duration::from_secs(self.max_stabilize_wait_secs),
            responsiveness_poll_interval: Duration::from_secs(self.responsiveness_poll_secs),
            max_unresponsive_polls: self.max_unresponsive_polls,
            restart_delay: Duration::from_secs(self.restart_delay_secs),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Listen port; 0 disables the API.
    #[serde(default)]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { port: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
device:
  vid: 0x04d9
  pid: 0xb534
midi:
  output_port: "loopMIDI"
"#;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: AppConfig = serde_yaml::from_str(MINIMAL).unwrap();
        assert_eq!(config.device.vid, 0x04d9);
        assert_eq!(config.midi.output_port, "loopMIDI");
        assert_eq!(config.queue_capacity, 100);
        assert_eq!(config.max_command_age(), Duration::from_secs(2));
        assert!(config.reconcile_interval().is_none());
        assert!(!config.supervisor.enabled);
        assert_eq!(config.api.port, 0);
        assert_eq!(config.power.settling_window(), Duration::from_secs(2));
    }

    #[test]
    fn bindings_default_to_power_dim_mute() {
        let b = KnobBindings::default();
        assert_eq!(b.command_for(ButtonKey::Click), Some(CommandKind::PowerToggle));
        assert_eq!(
            b.command_for(ButtonKey::DoubleClick),
            Some(CommandKind::DimToggle)
        );
        assert_eq!(
            b.command_for(ButtonKey::LongPress),
            Some(CommandKind::MuteToggle)
        );
    }

    #[test]
    fn bindings_can_be_unbound() {
        let yaml = r#"
click: none
double_click: mute
triple_click: dim
long_press: power
"#;
        let b: KnobBindings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(b.command_for(ButtonKey::Click), None);
        assert_eq!(
            b.command_for(ButtonKey::DoubleClick),
            Some(CommandKind::MuteToggle)
        );
    }

    #[test]
    fn supervisor_settings_convert_to_durations() {
        let s = SupervisorSettings::default();
        let c = s.to_config();
        assert_eq!(c.responsiveness_poll_interval, Duration::from_secs(5));
        assert_eq!(c.max_unresponsive_polls, 6);
        assert_eq!(c.window_stability_count, 4);
    }
}
