//! Command vocabulary flowing through the bridge queue.

use crate::state::PowerTarget;
use anyhow::Result;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Who produced a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    /// The physical knob.
    Device,
    /// A network-facing control surface (REST, etc.).
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Signed, rate-shaped volume step.
    VolumeStep(i32),
    MuteToggle,
    DimToggle,
    /// Fire the control channel's power toggle. The channel cannot express
    /// an absolute target, so this flips blindly.
    PowerToggle,
    /// Drive power to an absolute state through visual verification. Only
    /// external callers can produce this; the knob only toggles.
    PowerSet(PowerTarget),
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::VolumeStep(n) => write!(f, "volume{n:+}"),
            CommandKind::MuteToggle => write!(f, "mute"),
            CommandKind::DimToggle => write!(f, "dim"),
            CommandKind::PowerToggle => write!(f, "power-toggle"),
            CommandKind::PowerSet(t) => write!(f, "power-set({t})"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ControlCommand {
    pub kind: CommandKind,
    pub source: CommandSource,
}

/// A command as it sits in the queue. The timestamp lets the emitter drop
/// commands that aged out while the queue was backed up - a volume step
/// from two seconds ago is worse than no step at all.
#[derive(Debug, Clone, Copy)]
pub struct QueuedCommand {
    pub command: ControlCommand,
    pub enqueued_at: Instant,
}

impl QueuedCommand {
    pub fn new(command: ControlCommand) -> Self {
        Self {
            command,
            enqueued_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Handle for submitting external commands into the bridge queue. Clones
/// share the same bounded queue as the device pipeline, so ordering across
/// sources is exactly enqueue order.
#[derive(Clone)]
pub struct CommandSubmitter {
    tx: mpsc::Sender<QueuedCommand>,
}

impl CommandSubmitter {
    pub fn new(tx: mpsc::Sender<QueuedCommand>) -> Self {
        Self { tx }
    }

    pub async fn submit(&self, kind: CommandKind) -> Result<()> {
        self.tx
            .send(QueuedCommand::new(ControlCommand {
                kind,
                source: CommandSource::External,
            }))
            .await
            .map_err(|_| anyhow::anyhow!("bridge queue closed"))
    }
}
