//! Command emitter.
//!
//! Single consumer of the bridge queue and sole writer to the control
//! channel, so protocol messages never interleave and leave in exactly
//! enqueue order. Volume, mute, and dim updates are optimistic; power
//! verification is delegated to the power state machine.

use crate::command::{CommandKind, QueuedCommand};
use crate::errors::TransportError;
use crate::power::PowerStateMachine;
use crate::proto::{ProtocolMessage, ProtocolTransport};
use crate::retry::RetryLog;
use crate::state::{Gate, GateReason, PowerState, StateModel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub struct CommandEmitter {
    rx: mpsc::Receiver<QueuedCommand>,
    transport: Box<dyn ProtocolTransport>,
    model: StateModel,
    power: Option<Arc<PowerStateMachine>>,
    retry: RetryLog,
    /// Write attempts (including reconnects) before a command is given up.
    max_write_attempts: u32,
    reconnect_delay: Duration,
    /// Commands older than this are dropped instead of replayed late.
    max_command_age: Duration,
    /// Absolute volume pushed once at startup to converge the mirror.
    startup_volume: Option<u8>,
}

impl CommandEmitter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<QueuedCommand>,
        transport: Box<dyn ProtocolTransport>,
        model: StateModel,
        power: Option<Arc<PowerStateMachine>>,
        max_write_attempts: u32,
        reconnect_delay: Duration,
        max_command_age: Duration,
        startup_volume: Option<u8>,
    ) -> Self {
        Self {
            rx,
            transport,
            model,
            power,
            retry: RetryLog::new(),
            max_write_attempts: max_write_attempts.max(1),
            reconnect_delay,
            max_command_age,
            startup_volume,
        }
    }

    /// Consume until every queue sender is gone (that is how shutdown
    /// propagates here: the pipeline and submitters drop their ends).
    pub async fn run(mut self) {
        info!("command emitter started");

        if let Some(volume) = self.startup_volume {
            let volume = volume.min(127);
            match self.write(ProtocolMessage::VolumeAbsolute(volume)).await {
                Ok(()) => {
                    self.model.set_volume(volume);
                    info!("startup volume set to {volume}");
                }
                Err(e) => warn!("startup volume write failed: {e}"),
            }
        }

        while let Some(queued) = self.rx.recv().await {
            self.process(queued).await;
        }
        info!("command emitter stopped");
    }

    async fn process(&mut self, queued: QueuedCommand) {
        let command = queued.command;

        if queued.age() > self.max_command_age {
            warn!("discarding stale command {} ({:?} old)", command.kind, queued.age());
            return;
        }

        // Commands are held off while a power transition settles; power
        // commands additionally honor the cooldown.
        let gate = match command.kind {
            CommandKind::PowerToggle | CommandKind::PowerSet(_) => self.model.power_gate(),
            _ => self.model.command_gate(),
        };
        if let Gate::Blocked { remaining, reason } = gate {
            let why = match reason {
                GateReason::PowerSettling => "power settling",
                GateReason::PowerCooldown => "power cooldown",
            };
            warn!(
                "{} blocked: {why} ({:.1}s remaining)",
                command.kind,
                remaining.as_secs_f32()
            );
            return;
        }

        debug!("processing {} from {:?}", command.kind, command.source);

        match command.kind {
            CommandKind::VolumeStep(delta) => self.volume_step(delta).await,
            CommandKind::MuteToggle => {
                let desired = !self.model.snapshot().muted;
                if self.write(ProtocolMessage::Mute(desired)).await.is_ok() {
                    self.model.set_mute(desired);
                }
            }
            CommandKind::DimToggle => {
                let desired = !self.model.snapshot().dimmed;
                if self.write(ProtocolMessage::Dim(desired)).await.is_ok() {
                    self.model.set_dim(desired);
                }
            }
            CommandKind::PowerToggle => match self.write(ProtocolMessage::PowerToggle).await {
                Ok(()) => self.model.toggle_power_optimistic(),
                Err(e) => {
                    // Dropping a volume step is safe; dropping a power
                    // command is not. Force the mirror to unknown so
                    // nothing downstream trusts it.
                    error!("power toggle lost on the control channel: {e}; power state now unknown");
                    self.model.commit_power(PowerState::Unknown);
                }
            },
            CommandKind::PowerSet(target) => match &self.power {
                Some(machine) => {
                    let machine = Arc::clone(machine);
                    // UI settle delays run on a blocking thread; the queue
                    // stays serialized because we await completion here.
                    let result =
                        tokio::task::spawn_blocking(move || machine.set_state(target)).await;
                    match result {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => error!("power set failed: {e}"),
                        Err(e) => error!("power set task panicked: {e}"),
                    }
                }
                None => warn!("power-set({target}) ignored: power control unavailable"),
            },
        }
    }

    async fn volume_step(&mut self, delta: i32) {
        let current = self.model.effective_volume();
        let target = (current as i32 + delta).clamp(0, 127) as u8;
        if target == current {
            debug!(
                "volume already at {} limit ({current}), ignoring step {delta:+}",
                if delta > 0 { "upper" } else { "lower" }
            );
            return;
        }

        if self
            .write(ProtocolMessage::VolumeAbsolute(target))
            .await
            .is_ok()
        {
            debug!("volume {current} -> {target} ({delta:+})");
            self.model.set_volume(target);
        }
    }

    /// Write with bounded reconnect attempts. On exhaustion the error is
    /// surfaced to the caller, which decides whether dropping is safe.
    async fn write(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
        let mut last_err = None;
        for attempt in 0..self.max_write_attempts {
            match self.transport.send(message) {
                Ok(()) => {
                    self.retry.reset("transport");
                    return Ok(());
                }
                Err(e) => {
                    if self.retry.should_log("transport") {
                        warn!(
                            "control-channel write failed: {e} {}",
                            self.retry.describe("transport")
                        );
                    }
                    last_err = Some(e);
                    if attempt + 1 < self.max_write_attempts {
                        tokio::time::sleep(self.reconnect_delay).await;
                        if let Err(e) = self.transport.reconnect() {
                            debug!("reconnect attempt failed: {e}");
                        }
                    }
                }
            }
        }
        let e = last_err.unwrap_or_else(|| TransportError::WriteFailed("unknown".into()));
        warn!("giving up on {message} after {} attempts", self.max_write_attempts);
        Err(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandSource, ControlCommand};
    use parking_lot::Mutex;
    use std::time::Instant;

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<ProtocolMessage>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl ProtocolTransport for RecordingTransport {
        fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
            if *self.fail.lock() {
                return Err(TransportError::WriteFailed("port gone".into()));
            }
            self.sent.lock().push(message);
            Ok(())
        }

        fn reconnect(&mut self) -> Result<(), TransportError> {
            Err(TransportError::Reconnect("port gone".into()))
        }
    }

    fn model() -> StateModel {
        StateModel::new(64, Duration::from_millis(1), Duration::from_millis(1))
    }

    fn emitter(
        rx: mpsc::Receiver<QueuedCommand>,
        transport: RecordingTransport,
        model: StateModel,
    ) -> CommandEmitter {
        CommandEmitter::new(
            rx,
            Box::new(transport),
            model,
            None,
            2,
            Duration::from_millis(1),
            Duration::from_secs(2),
            None,
        )
    }

    fn queued(kind: CommandKind, source: CommandSource) -> QueuedCommand {
        QueuedCommand::new(ControlCommand { kind, source })
    }

    #[tokio::test]
    async fn commands_reach_transport_in_enqueue_order_across_sources() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);
        let m = model();

        tx.send(queued(CommandKind::VolumeStep(2), CommandSource::Device))
            .await
            .unwrap();
        tx.send(queued(CommandKind::MuteToggle, CommandSource::External))
            .await
            .unwrap();
        tx.send(queued(CommandKind::VolumeStep(-1), CommandSource::Device))
            .await
            .unwrap();
        drop(tx);

        emitter(rx, transport, m).run().await;

        assert_eq!(
            *sent.lock(),
            vec![
                ProtocolMessage::VolumeAbsolute(66),
                ProtocolMessage::Mute(true),
                ProtocolMessage::VolumeAbsolute(65),
            ]
        );
    }

    #[tokio::test]
    async fn volume_steps_clamp_and_skip_noop_writes() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);
        let m = model();

        tx.send(queued(CommandKind::VolumeStep(1000), CommandSource::Device))
            .await
            .unwrap();
        // Already at the ceiling: no message should go out.
        tx.send(queued(CommandKind::VolumeStep(5), CommandSource::Device))
            .await
            .unwrap();
        drop(tx);

        emitter(rx, transport, m.clone()).run().await;

        assert_eq!(*sent.lock(), vec![ProtocolMessage::VolumeAbsolute(127)]);
        assert_eq!(m.snapshot().volume, 127);
    }

    #[tokio::test]
    async fn failed_volume_write_is_dropped_without_model_update() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        *transport.fail.lock() = true;
        let m = model();

        tx.send(queued(CommandKind::VolumeStep(3), CommandSource::Device))
            .await
            .unwrap();
        drop(tx);

        emitter(rx, transport, m.clone()).run().await;

        // Optimistic update only happens after a successful write.
        assert_eq!(m.snapshot().volume, 64);
    }

    #[tokio::test]
    async fn failed_power_toggle_forces_power_unknown() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        *transport.fail.lock() = true;
        let m = model();
        m.commit_power(PowerState::On);

        tx.send(queued(CommandKind::PowerToggle, CommandSource::Device))
            .await
            .unwrap();
        drop(tx);

        emitter(rx, transport, m.clone()).run().await;

        assert_eq!(m.snapshot().power, PowerState::Unknown);
    }

    #[tokio::test]
    async fn successful_power_toggle_flips_optimistically() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        let m = model();
        m.commit_power(PowerState::Off);

        tx.send(queued(CommandKind::PowerToggle, CommandSource::External))
            .await
            .unwrap();
        drop(tx);

        emitter(rx, transport, m.clone()).run().await;

        assert_eq!(m.snapshot().power, PowerState::On);
    }

    #[tokio::test]
    async fn stale_commands_are_discarded() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);
        let m = model();

        let mut old = queued(CommandKind::VolumeStep(3), CommandSource::Device);
        old.enqueued_at = Instant::now() - Duration::from_secs(10);
        tx.send(old).await.unwrap();
        drop(tx);

        emitter(rx, transport, m).run().await;

        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn startup_volume_seeds_model_and_wire() {
        let (tx, rx) = mpsc::channel(16);
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);
        let m = model();
        drop(tx);

        CommandEmitter::new(
            rx,
            Box::new(transport),
            m.clone(),
            None,
            2,
            Duration::from_millis(1),
            Duration::from_secs(2),
            Some(80),
        )
        .run()
        .await;

        assert_eq!(*sent.lock(), vec![ProtocolMessage::VolumeAbsolute(80)]);
        assert_eq!(m.snapshot().volume, 80);
    }
}
