//! Local mirror of the monitor app's observable state.
//!
//! The app's control channel is send-only and its power state is only
//! visible on screen, so this model is updated optimistically by the
//! command emitter and reconciled by the power state machine. A single
//! mutex serializes all writers; readers get consistent snapshots.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tri-state power. `Unknown` is a first-class value: it means "do not
/// trust the mirror until the next successful reconciliation", not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerState {
    On,
    Off,
    Unknown,
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::On => write!(f, "on"),
            PowerState::Off => write!(f, "off"),
            PowerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// An absolute power target. Unlike [`PowerState`] there is no unknown:
/// callers asking for a state must name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PowerTarget {
    On,
    Off,
}

impl PowerTarget {
    pub fn as_power_state(self) -> PowerState {
        match self {
            PowerTarget::On => PowerState::On,
            PowerTarget::Off => PowerState::Off,
        }
    }
}

impl std::fmt::Display for PowerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerTarget::On => write!(f, "on"),
            PowerTarget::Off => write!(f, "off"),
        }
    }
}

/// Snapshot of the mirrored app state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AppState {
    pub power: PowerState,
    pub muted: bool,
    pub dimmed: bool,
    /// Volume on the control channel's 0-127 scale.
    pub volume: u8,
}

/// Why a command was refused by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    PowerSettling,
    PowerCooldown,
}

/// Result of asking whether a command may run right now.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gate {
    Allowed,
    Blocked { remaining: Duration, reason: GateReason },
}

type SubscriberFn = Arc<dyn Fn(&AppState) + Send + Sync>;

struct ModelInner {
    state: AppState,
    /// Start of the most recent power transition, if any.
    transition_started: Option<Instant>,
    settling: bool,
}

/// Shared handle to the state mirror. Cheap to clone.
#[derive(Clone)]
pub struct StateModel {
    inner: Arc<Mutex<ModelInner>>,
    subscribers: Arc<RwLock<Vec<SubscriberFn>>>,
    settling_window: Duration,
    /// Total lockout for further power commands, measured from the start
    /// of a transition (settling included).
    power_lockout: Duration,
}

impl StateModel {
    pub fn new(initial_volume: u8, settling_window: Duration, power_cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ModelInner {
                state: AppState {
                    power: PowerState::Unknown,
                    muted: false,
                    dimmed: false,
                    volume: initial_volume.min(127),
                },
                transition_started: None,
                settling: false,
            })),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            settling_window,
            power_lockout: settling_window + power_cooldown,
        }
    }

    pub fn snapshot(&self) -> AppState {
        self.inner.lock().state
    }

    /// Register a callback invoked after every state change.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&AppState) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(listener));
    }

    fn notify(&self, state: AppState) {
        for subscriber in self.subscribers.read().iter() {
            subscriber(&state);
        }
    }

    /// Volume the next step should be computed against.
    pub fn effective_volume(&self) -> u8 {
        self.inner.lock().state.volume
    }

    pub fn set_volume(&self, volume: u8) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.state.volume == volume {
                return;
            }
            inner.state.volume = volume.min(127);
            inner.state
        };
        self.notify(state);
    }

    pub fn set_mute(&self, muted: bool) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.state.muted == muted {
                return;
            }
            inner.state.muted = muted;
            inner.state
        };
        self.notify(state);
    }

    pub fn set_dim(&self, dimmed: bool) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.state.dimmed == dimmed {
                return;
            }
            inner.state.dimmed = dimmed;
            inner.state
        };
        self.notify(state);
    }

    /// Optimistic flip after a power toggle went out on the wire.
    /// `Unknown` stays `Unknown`: a toggle from an unknown state tells us
    /// nothing about where it landed.
    pub fn toggle_power_optimistic(&self) {
        let state = {
            let mut inner = self.inner.lock();
            inner.state.power = match inner.state.power {
                PowerState::On => PowerState::Off,
                PowerState::Off => PowerState::On,
                PowerState::Unknown => PowerState::Unknown,
            };
            inner.state
        };
        debug!("power mirrored optimistically as {}", state.power);
        self.notify(state);
    }

    /// Commit a reconciled power value (from visual sampling).
    pub fn commit_power(&self, power: PowerState) {
        let state = {
            let mut inner = self.inner.lock();
            if inner.state.power == power {
                return;
            }
            inner.state.power = power;
            inner.state
        };
        self.notify(state);
    }

    /// Mark the start of a verified power transition. All commands are
    /// gated while settling, power commands until the lockout expires.
    pub fn begin_power_transition(&self, target: PowerTarget) {
        let state = {
            let mut inner = self.inner.lock();
            inner.transition_started = Some(Instant::now());
            inner.settling = true;
            inner.state
        };
        debug!("power transition started, target {}", target);
        self.notify(state);
    }

    /// Mark the end of a transition, committing whatever the verification
    /// concluded. On failure callers pass `Unknown`, never the stale value.
    pub fn end_power_transition(&self, outcome: PowerState) {
        let state = {
            let mut inner = self.inner.lock();
            inner.settling = false;
            inner.state.power = outcome;
            inner.state
        };
        debug!("power transition ended: {}", outcome);
        self.notify(state);
    }

    /// Gate for any command. Blocked only while a transition is settling.
    pub fn command_gate(&self) -> Gate {
        let mut inner = self.inner.lock();
        if !inner.settling {
            return Gate::Allowed;
        }
        match inner.transition_started {
            Some(started) => {
                let elapsed = started.elapsed();
                if elapsed < self.settling_window {
                    Gate::Blocked {
                        remaining: self.settling_window - elapsed,
                        reason: GateReason::PowerSettling,
                    }
                } else {
                    // Settling expired without an explicit end; unstick.
                    inner.settling = false;
                    Gate::Allowed
                }
            }
            None => {
                inner.settling = false;
                Gate::Allowed
            }
        }
    }

    /// Gate for power commands: settling plus a cooldown window so a second
    /// toggle cannot land while the app is still reacting to the first.
    pub fn power_gate(&self) -> Gate {
        if let Gate::Blocked { remaining, reason } = self.command_gate() {
            return Gate::Blocked { remaining, reason };
        }
        let inner = self.inner.lock();
        match inner.transition_started {
            Some(started) => {
                let elapsed = started.elapsed();
                if elapsed < self.power_lockout {
                    Gate::Blocked {
                        remaining: self.power_lockout - elapsed,
                        reason: GateReason::PowerCooldown,
                    }
                } else {
                    Gate::Allowed
                }
            }
            None => Gate::Allowed,
        }
    }
}
