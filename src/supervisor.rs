//! External-process supervisor.
//!
//! Keeps the monitor app alive, window-stable, and minimized. The app is
//! known to recreate its window transiently during startup, so a single
//! positive window match is not trusted: the same identity must be seen
//! several polls in a row before anything caches it. Runs on its own
//! blocking thread and never stalls the pipeline or the emitter.

use crate::errors::SupervisorError;
use crate::process::{Pid, ProcessControl, ProcessHandle, WindowId};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Supervision states. `Halted` is terminal: the executable is missing or
/// unlaunchable and retrying would loop forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    NotRunning,
    Starting,
    Stabilizing,
    Running,
    Unresponsive,
    Restarting,
    Halted,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SupervisorState::NotRunning => "not-running",
            SupervisorState::Starting => "starting",
            SupervisorState::Stabilizing => "stabilizing",
            SupervisorState::Running => "running",
            SupervisorState::Unresponsive => "unresponsive",
            SupervisorState::Restarting => "restarting",
            SupervisorState::Halted => "halted",
        };
        f.write_str(s)
    }
}

/// Immutable supervisor tuning.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub executable: PathBuf,
    /// Process name used to adopt an instance that is already running.
    pub process_name: String,
    /// CPU percentage considered calm enough to launch into.
    pub startup_cpu_threshold: f32,
    pub startup_poll_interval: Duration,
    /// Upper bound on waiting for CPU calm; past it we launch anyway.
    pub max_startup_wait: Duration,
    pub post_launch_settle: Duration,
    /// Consecutive identical window observations required.
    pub window_stability_count: u32,
    pub stabilize_poll_interval: Duration,
    /// Stabilization deadline; past it the last-seen identity is used.
    pub max_stabilize_wait: Duration,
    pub responsiveness_poll_interval: Duration,
    pub max_unresponsive_polls: u32,
    pub restart_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            process_name: String::new(),
            startup_cpu_threshold: 2.0,
            startup_poll_interval: Duration::from_secs(5),
            max_startup_wait: Duration::from_secs(300),
            post_launch_settle: Duration::from_secs(5),
            window_stability_count: 4,
            stabilize_poll_interval: Duration::from_secs(1),
            max_stabilize_wait: Duration::from_secs(60),
            responsiveness_poll_interval: Duration::from_secs(5),
            max_unresponsive_polls: 6,
            restart_delay: Duration::from_secs(5),
        }
    }
}

/// System CPU load probe, behind a trait so tests can script boot storms.
pub trait CpuProbe: Send {
    fn cpu_percent(&mut self) -> f32;
}

/// sysinfo-backed probe.
pub struct SystemCpuProbe {
    sys: sysinfo::System,
}

impl SystemCpuProbe {
    pub fn new() -> Self {
        Self {
            sys: sysinfo::System::new(),
        }
    }
}

impl Default for SystemCpuProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuProbe for SystemCpuProbe {
    fn cpu_percent(&mut self) -> f32 {
        self.sys.refresh_cpu_usage();
        self.sys.global_cpu_usage()
    }
}

/// Boot-scoped one-shot flag, persisted as a temp file holding the boot
/// timestamp. Survives process restarts within the same boot; a reboot
/// (different boot time, beyond clock-drift tolerance) resets it.
pub struct StartupFlag {
    path: PathBuf,
}

const BOOT_TIME_TOLERANCE_SECS: u64 = 60;

impl StartupFlag {
    pub fn new(name: &str) -> Self {
        Self {
            path: std::env::temp_dir().join(name),
        }
    }

    #[cfg(test)]
    fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn is_set(&self) -> bool {
        let stored = match std::fs::read_to_string(&self.path) {
            Ok(s) => match s.trim().parse::<u64>() {
                Ok(v) => v,
                Err(_) => return false, // corrupted, treat as unset
            },
            Err(_) => return false,
        };
        let boot = sysinfo::System::boot_time();
        stored.abs_diff(boot) < BOOT_TIME_TOLERANCE_SECS
    }

    pub fn set(&self) {
        let boot = sysinfo::System::boot_time();
        if let Err(e) = std::fs::write(&self.path, boot.to_string()) {
            warn!("failed to write startup flag {}: {e}", self.path.display());
        }
    }
}

/// Callback invoked with the app's pid after each completed startup cycle.
pub type ReinitCallback = Arc<dyn Fn(Pid) + Send + Sync>;

struct StabilizeProgress {
    started: Instant,
    last: Option<WindowId>,
    consecutive: u32,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    control: Arc<dyn ProcessControl>,
    cpu: Box<dyn CpuProbe>,
    callbacks: Vec<ReinitCallback>,
    startup_flag: StartupFlag,
    shutdown: Arc<AtomicBool>,

    state: SupervisorState,
    handle: Option<ProcessHandle>,
    unresponsive_polls: u32,
    stabilize: Option<StabilizeProgress>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        control: Arc<dyn ProcessControl>,
        cpu: Box<dyn CpuProbe>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            control,
            cpu,
            callbacks: Vec::new(),
            startup_flag: StartupFlag::new("volknob-gw-startup.flag"),
            shutdown,
            state: SupervisorState::NotRunning,
            handle: None,
            unresponsive_polls: 0,
            stabilize: None,
        }
    }

    /// Register a callback for the fan-out that fires once per completed
    /// startup cycle (initial start and every restart).
    pub fn on_reinit(&mut self, callback: ReinitCallback) {
        self.callbacks.push(callback);
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pid(&self) -> Option<Pid> {
        self.handle.as_ref().map(|h| h.pid)
    }

    /// Blocking supervision loop; run via `tokio::task::spawn_blocking`.
    pub fn run(mut self) {
        info!("supervisor started for '{}'", self.config.process_name);
        while !self.shutdown.load(Ordering::Relaxed) {
            self.poll_once();
            if self.state == SupervisorState::Halted {
                error!("supervisor halted; the monitor app will not be restarted");
                break;
            }
            self.sleep_interruptibly(self.poll_interval());
        }
        info!("supervisor stopped");
    }

    /// Interval until the next poll, by state.
    fn poll_interval(&self) -> Duration {
        match self.state {
            SupervisorState::Stabilizing => self.config.stabilize_poll_interval,
            SupervisorState::Restarting => self.config.restart_delay,
            _ => self.config.responsiveness_poll_interval,
        }
    }

    fn sleep_interruptibly(&self, total: Duration) {
        let slice = Duration::from_millis(200);
        let deadline = Instant::now() + total;
        while !self.shutdown.load(Ordering::Relaxed) {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(slice.min(left));
        }
    }

    /// One supervision step. Separated from `run` so tests can drive the
    /// machine without real time.
    pub fn poll_once(&mut self) {
        match self.state {
            SupervisorState::NotRunning => {
                self.state = SupervisorState::Starting;
                self.poll_once();
            }
            SupervisorState::Starting => self.do_start(),
            SupervisorState::Stabilizing => self.do_stabilize_poll(),
            SupervisorState::Running | SupervisorState::Unresponsive => self.do_watch(),
            SupervisorState::Restarting => {
                self.unresponsive_polls = 0;
                self.state = SupervisorState::Starting;
            }
            SupervisorState::Halted => {}
        }
    }

    fn do_start(&mut self) {
        // Adopt an instance that is already running (e.g. the user started
        // it by hand) instead of spawning a second one.
        if let Some(pid) = self.control.find_by_name(&self.config.process_name) {
            info!("adopting running {} (pid {pid})", self.config.process_name);
            self.handle = Some(ProcessHandle {
                pid,
                launched_at: Instant::now(),
                window: None,
            });
            self.begin_stabilizing();
            return;
        }

        // Gate the very first launch of a boot on system load: contending
        // with boot-time churn makes the app's startup pathological. Not a
        // correctness condition, so timing out proceeds anyway.
        if !self.startup_flag.is_set() {
            self.wait_for_cpu_calm();
        }

        if !self.config.executable.is_file() {
            error!(
                "{}",
                SupervisorError::LaunchFailed {
                    path: self.config.executable.clone(),
                    reason: "executable not found".into(),
                }
            );
            self.state = SupervisorState::Halted;
            return;
        }

        match self.control.launch(&self.config.executable) {
            Ok(handle) => {
                info!(
                    "launched {} (pid {})",
                    self.config.process_name, handle.pid
                );
                self.handle = Some(handle);
                std::thread::sleep(self.config.post_launch_settle);
                self.begin_stabilizing();
            }
            Err(e) => {
                error!("{e}");
                self.state = SupervisorState::Halted;
            }
        }
    }

    fn begin_stabilizing(&mut self) {
        self.stabilize = Some(StabilizeProgress {
            started: Instant::now(),
            last: None,
            consecutive: 0,
        });
        self.state = SupervisorState::Stabilizing;
    }

    /// One stabilization poll: observe the window, minimize whatever is
    /// there, and count consecutive identical identities.
    fn do_stabilize_poll(&mut self) {
        let pid = match self.handle.as_ref().map(|h| h.pid) {
            Some(pid) => pid,
            None => {
                self.state = SupervisorState::Starting;
                return;
            }
        };

        if !self.control.is_running(pid) {
            warn!("{} exited during stabilization", self.config.process_name);
            self.handle = None;
            self.state = SupervisorState::Starting;
            return;
        }

        let progress = self.stabilize.as_mut().expect("stabilizing without progress");

        match self.control.find_window(pid) {
            Some(window) => {
                // The app sometimes starts visible; push it down on every
                // poll rather than once at the end.
                self.control.minimize(window);

                if progress.last == Some(window) {
                    progress.consecutive += 1;
                } else {
                    debug!("new window identity {window}, resetting stability count");
                    progress.last = Some(window);
                    progress.consecutive = 1;
                }
                debug!(
                    "stabilizing: window {window} seen {}x (need {})",
                    progress.consecutive, self.config.window_stability_count
                );
            }
            None => {
                progress.last = None;
                progress.consecutive = 0;
            }
        }

        if progress.consecutive >= self.config.window_stability_count {
            let window = progress.last;
            info!("window identity {} is stable", window.expect("counted"));
            self.finish_stabilizing(window);
        } else if progress.started.elapsed() >= self.config.max_stabilize_wait {
            // Degraded confidence: trust whatever we saw last rather than
            // block supervision forever.
            let window = progress.last;
            warn!(
                "window identity never stabilized within {:?}; proceeding with {:?}",
                self.config.max_stabilize_wait, window
            );
            self.finish_stabilizing(window);
        }
    }

    fn finish_stabilizing(&mut self, window: Option<WindowId>) {
        if let Some(handle) = self.handle.as_mut() {
            handle.window = window;
        }
        self.stabilize = None;
        self.unresponsive_polls = 0;
        self.state = SupervisorState::Running;
        self.startup_flag.set();

        if let Some(pid) = self.pid() {
            info!("startup cycle complete (pid {pid}), notifying {} listener(s)", self.callbacks.len());
            for callback in &self.callbacks {
                callback(pid);
            }
        }
    }

    /// One watchdog poll in Running/Unresponsive.
    fn do_watch(&mut self) {
        let pid = match self.pid() {
            Some(pid) => pid,
            None => {
                self.state = SupervisorState::Starting;
                return;
            }
        };

        if !self.control.is_running(pid) {
            warn!("{} is gone (pid {pid}); restarting", self.config.process_name);
            self.handle = None;
            self.unresponsive_polls = 0;
            self.state = SupervisorState::Starting;
            return;
        }

        if self.control.is_responsive(pid) {
            if self.unresponsive_polls > 0 {
                info!(
                    "{} responsive again (streak was {})",
                    self.config.process_name, self.unresponsive_polls
                );
            }
            self.unresponsive_polls = 0;
            self.state = SupervisorState::Running;
            return;
        }

        self.unresponsive_polls += 1;
        self.state = SupervisorState::Unresponsive;
        warn!(
            "{} not responding, streak {}/{}",
            self.config.process_name, self.unresponsive_polls, self.config.max_unresponsive_polls
        );

        if self.unresponsive_polls >= self.config.max_unresponsive_polls {
            error!(
                "{} hung for ~{:?}; terminating",
                self.config.process_name,
                self.config.responsiveness_poll_interval * self.config.max_unresponsive_polls
            );
            self.control.terminate(pid);
            self.handle = None;
            self.state = SupervisorState::Restarting;
        }
    }

    fn wait_for_cpu_calm(&mut self) {
        let deadline = Instant::now() + self.config.max_startup_wait;
        info!(
            "waiting for CPU below {:.1}% before first launch",
            self.config.startup_cpu_threshold
        );
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            let load = self.cpu.cpu_percent();
            if load < self.config.startup_cpu_threshold {
                info!("CPU {load:.1}% below threshold, proceeding");
                return;
            }
            if Instant::now() >= deadline {
                warn!("CPU never calmed down ({load:.1}%); launching anyway");
                return;
            }
            debug!("CPU {load:.1}% still busy");
            self.sleep_interruptibly(self.config.startup_poll_interval);
        }
    }
}
