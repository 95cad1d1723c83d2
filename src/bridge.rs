//! Bridge wiring.
//!
//! Owns the bounded command queue and spawns the long-lived tasks: the
//! blocking pipeline reader, the emitter consumer, the supervisor poller,
//! an optional power-reconciliation poller, and the API server. Tasks
//! communicate only through the queue and the shared state model.

use crate::accel::Accelerator;
use crate::command::{CommandSubmitter, QueuedCommand};
use crate::config::AppConfig;
use crate::device::DeviceSource;
use crate::emitter::CommandEmitter;
use crate::pipeline::EventPipeline;
use crate::power::PowerStateMachine;
use crate::process::ProcessControl;
use crate::proto::ProtocolTransport;
use crate::state::StateModel;
use crate::supervisor::{ProcessSupervisor, SystemCpuProbe};
use crate::{api, automation};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Everything the bridge talks to but does not own the implementation of.
pub struct Collaborators {
    pub device: Box<dyn DeviceSource>,
    pub transport: Box<dyn ProtocolTransport>,
    /// Process/window control; absent on platforms without it, which
    /// disables supervision and power verification.
    pub process: Option<Arc<dyn ProcessControl>>,
    pub sampler: Option<Arc<dyn automation::VisualSampler>>,
    pub ui: Option<Arc<dyn automation::UiInteraction>>,
}

pub struct Bridge {
    config: AppConfig,
    model: StateModel,
    shutdown: Arc<AtomicBool>,
}

impl Bridge {
    pub fn new(config: AppConfig) -> Self {
        let model = StateModel::new(
            config.startup_volume.unwrap_or(64),
            config.power.settling_window(),
            config.power.cooldown_window(),
        );
        Self {
            config,
            model,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn model(&self) -> StateModel {
        self.model.clone()
    }

    /// Run until `shutdown_signal` resolves. Cooperative: in-flight writes
    /// finish, every task observes the flag at its next blocking point.
    pub async fn run(
        self,
        collaborators: Collaborators,
        shutdown_signal: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let Collaborators {
            device,
            transport,
            process,
            sampler,
            ui,
        } = collaborators;

        let (tx, rx) = mpsc::channel::<QueuedCommand>(self.config.queue_capacity);

        // Power verification needs all three automation seams.
        let power = match (&process, sampler, ui) {
            (Some(process), Some(sampler), Some(ui)) => Some(Arc::new(PowerStateMachine::new(
                Arc::clone(process),
                sampler,
                ui,
                self.model.clone(),
                self.config.power.to_config(),
                self.config.supervisor.process_name.clone(),
            ))),
            _ => {
                warn!("power control unavailable: absolute power commands will be ignored");
                None
            }
        };

        // Log every state change; the mirror is the only view anyone has
        // of the app, so the trail matters.
        self.model.subscribe(|s| {
            info!(
                "state: volume={} muted={} dimmed={} power={}",
                s.volume, s.muted, s.dimmed, s.power
            );
        });

        let pipeline = EventPipeline::new(
            device,
            Accelerator::new(self.config.accel.clone()),
            self.config.device.bindings.clone(),
            tx.clone(),
            Arc::clone(&self.shutdown),
            self.config.device.reopen_delay(),
        );
        let pipeline_task = tokio::task::spawn_blocking(move || pipeline.run());

        let emitter = CommandEmitter::new(
            rx,
            transport,
            self.model.clone(),
            power.clone(),
            self.config.midi.max_write_attempts,
            self.config.midi.reconnect_delay(),
            self.config.max_command_age(),
            self.config.startup_volume,
        );
        let emitter_task = tokio::spawn(emitter.run());

        let supervisor_task = match (&process, self.config.supervisor.enabled) {
            (Some(process), true) => {
                let mut supervisor = ProcessSupervisor::new(
                    self.config.supervisor.to_config(),
                    Arc::clone(process),
                    Box::new(SystemCpuProbe::new()),
                    Arc::clone(&self.shutdown),
                );
                if let Some(power) = power.clone() {
                    let model = self.model.clone();
                    supervisor.on_reinit(Arc::new(move |pid| {
                        // The restarted app has a brand-new window; every
                        // cached identity is garbage now.
                        power.invalidate_window();
                        match power.get_state() {
                            Ok(state) => model.commit_power(state),
                            Err(e) => {
                                warn!("post-restart reconciliation failed (pid {pid}): {e}");
                                model.commit_power(crate::state::PowerState::Unknown);
                            }
                        }
                    }));
                }
                Some(tokio::task::spawn_blocking(move || supervisor.run()))
            }
            (None, true) => {
                warn!("supervisor enabled in config but process control is unavailable here");
                None
            }
            _ => None,
        };

        let reconcile_task = match (power.clone(), self.config.reconcile_interval()) {
            (Some(power), Some(interval)) => Some(tokio::spawn(reconcile_loop(
                power,
                self.model.clone(),
                interval,
                Arc::clone(&self.shutdown),
            ))),
            _ => None,
        };

        let api_task = if self.config.api.port > 0 {
            let submitter = CommandSubmitter::new(tx.clone());
            Some(tokio::spawn(api::serve(
                self.config.api.port,
                self.model.clone(),
                submitter,
            )))
        } else {
            None
        };

        // The emitter exits when every sender is gone; ours goes now so
        // only the pipeline and the API hold the queue open.
        drop(tx);

        shutdown_signal.await;
        info!("shutting down bridge...");
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(task) = api_task {
            task.abort();
        }
        if let Some(task) = reconcile_task {
            task.abort();
        }
        if let Err(e) = pipeline_task.await {
            warn!("pipeline task join failed: {e}");
        }
        if let Err(e) = emitter_task.await {
            warn!("emitter task join failed: {e}");
        }
        if let Some(task) = supervisor_task {
            if let Err(e) = task.await {
                warn!("supervisor task join failed: {e}");
            }
        }

        info!("bridge stopped");
        Ok(())
    }
}

/// Periodically re-sample power so the mirror converges even when nobody
/// is issuing commands (the app can be powered from its own UI).
async fn reconcile_loop(
    power: Arc<PowerStateMachine>,
    model: StateModel,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        let power = Arc::clone(&power);
        let sampled = tokio::task::spawn_blocking(move || power.get_state()).await;
        match sampled {
            Ok(Ok(state)) => model.commit_power(state),
            Ok(Err(e)) => tracing::debug!("reconciliation sample failed: {e}"),
            Err(e) => warn!("reconciliation task failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accel::AccelConfig;
    use crate::config::KnobBindings;
    use crate::device::{DeviceEvent, DeviceInput};
    use crate::errors::{DeviceError, TransportError};
    use crate::proto::ProtocolMessage;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Instant;

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

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<ProtocolMessage>>>,
    }

    impl ProtocolTransport for RecordingTransport {
        fn send(&mut self, message: ProtocolMessage) -> Result<(), TransportError> {
            self.sent.lock().push(message);
            Ok(())
        }
        fn reconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Whole data path: a rapid detent burst goes knob -> pipeline ->
    /// queue -> emitter -> transport, accelerated and strictly in order.
    #[tokio::test]
    async fn detent_burst_reaches_transport_accelerated_and_ordered() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let t0 = Instant::now();
        let script: VecDeque<DeviceEvent> = (0..5)
            .map(|i| DeviceEvent {
                input: DeviceInput::Rotate { delta: 1 },
                at: t0 + Duration::from_millis(i * 40),
            })
            .collect();

        let (tx, rx) = mpsc::channel(100);
        let model = StateModel::new(64, Duration::from_millis(1), Duration::from_millis(1));
        let transport = RecordingTransport::default();
        let sent = Arc::clone(&transport.sent);

        let pipeline = EventPipeline::new(
            Box::new(ScriptedSource {
                script,
                shutdown: Arc::clone(&shutdown),
            }),
            Accelerator::new(AccelConfig::default()),
            KnobBindings::default(),
            tx,
            shutdown,
            Duration::from_millis(1),
        );
        let emitter = crate::emitter::CommandEmitter::new(
            rx,
            Box::new(transport),
            model.clone(),
            None,
            2,
            Duration::from_millis(1),
            Duration::from_secs(2),
            None,
        );

        let pipeline_task = tokio::task::spawn_blocking(move || pipeline.run());
        let emitter_task = tokio::spawn(emitter.run());
        pipeline_task.await.unwrap();
        emitter_task.await.unwrap();

        let messages = sent.lock();
        let volumes: Vec<u8> = messages
            .iter()
            .map(|m| match m {
                ProtocolMessage::VolumeAbsolute(v) => *v,
                other => panic!("unexpected message {other}"),
            })
            .collect();

        // Cumulative movement rides the fast part of the curve.
        assert!(
            volumes.last().unwrap() - 64 >= 10,
            "burst only moved volume to {:?}",
            volumes.last()
        );
        // Absolute targets leave in enqueue order, so they are ascending.
        let mut sorted = volumes.clone();
        sorted.sort_unstable();
        assert_eq!(volumes, sorted);
        assert_eq!(model.snapshot().volume, *volumes.last().unwrap());
    }
}
