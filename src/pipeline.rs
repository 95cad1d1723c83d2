//! Device event pipeline.
//!
//! A blocking loop that reads the knob, rate-shapes rotation through the
//! accelerator, and pushes commands onto the bounded bridge queue. When
//! the queue is full the loop blocks rather than drop: device events are
//! latency-tolerant but losing a detent desynchronizes the volume mirror.
//! Runs on a dedicated blocking thread so the rest of the bridge never
//! waits on a HID read.

use crate::accel::Accelerator;
use crate::command::{CommandKind, CommandSource, ControlCommand, QueuedCommand};
use crate::config::KnobBindings;
use crate::device::{DeviceInput, DeviceSource};
use crate::retry::RetryLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct EventPipeline {
    source: Box<dyn DeviceSource>,
    accel: Accelerator,
    bindings: KnobBindings,
    tx: mpsc::Sender<QueuedCommand>,
    shutdown: Arc<AtomicBool>,
    retry: RetryLog,
    reopen_delay: Duration,
}

impl EventPipeline {
    pub fn new(
        source: Box<dyn DeviceSource>,
        accel: Accelerator,
        bindings: KnobBindings,
        tx: mpsc::Sender<QueuedCommand>,
        shutdown: Arc<AtomicBool>,
        reopen_delay: Duration,
    ) -> Self {
        Self {
            source,
            accel,
            bindings,
            tx,
            shutdown,
            retry: RetryLog::new(),
            reopen_delay,
        }
    }

    /// Blocking loop; run via `tokio::task::spawn_blocking`. Returns when
    /// the shutdown flag is set or the queue closes.
    pub fn run(mut self) {
        info!("event pipeline started");
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.source.read_next() {
                Ok(Some(event)) => {
                    if !self.handle_input(event.input, event.at) {
                        break; // queue closed
                    }
                }
                Ok(None) => {
                    // Read timeout: just a chance to observe shutdown.
                }
                Err(e) => {
                    if self.retry.should_log("device") {
                        warn!(
                            "knob read failed: {e}. Reconnecting... {}",
                            self.retry.describe("device")
                        );
                    }
                    std::thread::sleep(self.reopen_delay);
                    if self.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if self.source.reopen().is_ok() {
                        info!("knob reconnected");
                        self.retry.reset("device");
                    }
                }
            }
        }
        info!("event pipeline stopped");
    }

    fn handle_input(&mut self, input: DeviceInput, at: std::time::Instant) -> bool {
        match input {
            DeviceInput::Rotate { delta } => {
                let step = self.accel.step(delta, at);
                if step == 0 {
                    return true;
                }
                debug!("rotate {delta:+} -> step {step:+}");
                self.enqueue(CommandKind::VolumeStep(step))
            }
            DeviceInput::Button { key } => match self.bindings.command_for(key) {
                Some(kind) => {
                    debug!("{key} -> {kind}");
                    self.enqueue(kind)
                }
                None => {
                    debug!("no binding for {key}");
                    true
                }
            },
        }
    }

    /// Push with backpressure. False means the queue closed (shutdown).
    fn enqueue(&self, kind: CommandKind) -> bool {
        let queued = QueuedCommand::new(ControlCommand {
            kind,
            source: CommandSource::Device,
        });
        self.tx.blocking_send(queued).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::AccelConfig;
    use crate::device::{ButtonKey, DeviceEvent};
    use crate::errors::DeviceError;
    use std::collections::VecDeque;
    use std::time::Instant;

    /// Scripted source: plays back a fixed event list, then requests
    /// shutdown and idles.
    struct ScriptedSource {
        script: VecDeque<DeviceEvent>,
        shutdown: Arc<AtomicBool>,
    }

    impl DeviceSource for ScriptedSource {
        fn read_next(&mut self) -> Result<Option<DeviceEvent>, DeviceError> {
            match self.script.pop_front() {
                Some(event) => Ok(Some(event)),
                None => {
                    self.shutdown.store(true, Ordering::Relaxed);
                    Ok(None)
                }
            }
        }

        fn reopen(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn rotate(at: Instant, offset_ms: u64, delta: i32) -> DeviceEvent {
        DeviceEvent {
            input: DeviceInput::Rotate { delta },
            at: at + Duration::from_millis(offset_ms),
        }
    }

    fn button(at: Instant, key: ButtonKey) -> DeviceEvent {
        DeviceEvent {
            input: DeviceInput::Button { key },
            at,
        }
    }

    fn run_pipeline(script: Vec<DeviceEvent>) -> Vec<CommandKind> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(100);
        let pipeline = EventPipeline::new(
            Box::new(ScriptedSource {
                script: script.into(),
                shutdown: Arc::clone(&shutdown),
            }),
            Accelerator::new(AccelConfig::default()),
            KnobBindings::default(),
            tx,
            shutdown,
            Duration::from_millis(1),
        );

        let handle = std::thread::spawn(move || pipeline.run());
        handle.join().unwrap();

        let mut kinds = Vec::new();
        while let Ok(cmd) = rx.try_recv() {
            kinds.push(cmd.command.kind);
        }
        kinds
    }

    #[test]
    fn rapid_rotation_accumulates_accelerated_steps_in_order() {
        let t0 = Instant::now();
        let script = (0..5).map(|i| rotate(t0, i * 40, 1)).collect();
        let kinds = run_pipeline(script);

        assert_eq!(kinds.len(), 5);
        let total: i32 = kinds
            .iter()
            .map(|k| match k {
                CommandKind::VolumeStep(n) => *n,
                other => panic!("unexpected command {other}"),
            })
            .sum();
        assert!(total >= 10, "cumulative step {total} below fast-path floor");

        // Steps leave in the order the detents arrived.
        assert_eq!(kinds[0], CommandKind::VolumeStep(1));
    }

    #[test]
    fn buttons_map_through_bindings_without_acceleration() {
        let t0 = Instant::now();
        let kinds = run_pipeline(vec![
            button(t0, ButtonKey::Click),
            button(t0, ButtonKey::LongPress),
            button(t0, ButtonKey::DoubleClick),
        ]);
        assert_eq!(
            kinds,
            vec![
                CommandKind::PowerToggle,
                CommandKind::MuteToggle,
                CommandKind::DimToggle,
            ]
        );
    }

    #[test]
    fn device_failure_reopens_and_continues() {
        struct FlakySource {
            calls: u32,
            shutdown: Arc<AtomicBool>,
        }
        impl DeviceSource for FlakySource {
            fn read_next(&mut self) -> Result<Option<DeviceEvent>, DeviceError> {
                self.calls += 1;
                match self.calls {
                    1 => Err(DeviceError::Unavailable("unplugged".into())),
                    2 => Ok(Some(DeviceEvent {
                        input: DeviceInput::Rotate { delta: 1 },
                        at: Instant::now(),
                    })),
                    _ => {
                        self.shutdown.store(true, Ordering::Relaxed);
                        Ok(None)
                    }
                }
            }
            fn reopen(&mut self) -> Result<(), DeviceError> {
                Ok(())
            }
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, mut rx) = mpsc::channel(10);
        let pipeline = EventPipeline::new(
            Box::new(FlakySource {
                calls: 0,
                shutdown: Arc::clone(&shutdown),
            }),
            Accelerator::new(AccelConfig::default()),
            KnobBindings::default(),
            tx,
            shutdown,
            Duration::from_millis(1),
        );
        std::thread::spawn(move || pipeline.run()).join().unwrap();

        let cmd = rx.try_recv().expect("event after reopen");
        assert!(matches!(cmd.command.kind, CommandKind::VolumeStep(_)));
    }
}
