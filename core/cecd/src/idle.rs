//! Idle-screen task.
//!
//! Blanks the display once the user has been idle long enough and restores it
//! on the first input. Runs on its own thread, started and stopped only by
//! the dispatcher; at most one instance exists at a time.

use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::bus::BusConnection;
use crate::cec::CecFrame;
use crate::config::IdleConfig;
use crate::corrector::parse_frame;
use crate::error::{ConfigError, IdleTaskError, ProbeError};

/// Longest accepted blank threshold.
pub const MAX_BLANK_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Reports how long the user has been idle.
pub trait InputProbe: Send {
    fn idle_time(&mut self) -> Result<Duration, ProbeError>;
}

/// Runs a command that prints the idle time in milliseconds (`xprintidle`).
pub struct CommandInputProbe {
    command: Vec<String>,
}

impl CommandInputProbe {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl InputProbe for CommandInputProbe {
    fn idle_time(&mut self) -> Result<Duration, ProbeError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ProbeError::Output("probe command is empty".to_string()));
        };
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .map_err(|source| ProbeError::Spawn {
                program: program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Failed(output.status.to_string()));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|_| ProbeError::Output(text.trim().to_string()))
    }
}

pub type ProbeFactory = Box<dyn Fn() -> Box<dyn InputProbe> + Send>;

#[derive(Debug, Clone)]
pub struct IdleSettings {
    pub blank_after: Duration,
    pub poll_interval: Duration,
    pub max_probe_failures: u32,
    pub blank_frames: Vec<CecFrame>,
    pub wake_frames: Vec<CecFrame>,
}

impl IdleSettings {
    pub fn from_config(config: &IdleConfig) -> Result<Self, ConfigError> {
        let frames = |field: &'static str, list: &[String]| {
            list.iter()
                .map(|frame| parse_frame(field, frame))
                .collect::<Result<Vec<_>, _>>()
        };
        let settings = Self {
            blank_after: Duration::from_secs(config.blank_after_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_probe_failures: config.max_probe_failures.max(1),
            blank_frames: frames("idle.blank_frames", &config.blank_frames)?,
            wake_frames: frames("idle.wake_frames", &config.wake_frames)?,
        };
        validate_blank_after(settings.blank_after)
            .map_err(|_| ConfigError::invalid("idle.blank_after_secs", "must be 1..=86400"))?;
        if settings.poll_interval.is_zero() {
            return Err(ConfigError::invalid("idle.poll_interval_ms", "must be positive"));
        }
        Ok(settings)
    }
}

fn validate_blank_after(blank_after: Duration) -> Result<(), IdleTaskError> {
    if blank_after.is_zero() || blank_after > MAX_BLANK_AFTER {
        return Err(IdleTaskError::InvalidTimeout(blank_after));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleExit {
    Stopped,
    ProbeFailed,
}

struct RunningTask {
    stop: Sender<()>,
    handle: JoinHandle<IdleExit>,
}

pub struct IdleController {
    settings: IdleSettings,
    probe_factory: ProbeFactory,
    task: Option<RunningTask>,
}

impl IdleController {
    pub fn new(settings: IdleSettings, probe_factory: ProbeFactory) -> Self {
        Self {
            settings,
            probe_factory,
            task: None,
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.reap();
        self.task.is_some()
    }

    /// Starts the task. `blank_after` overrides the configured threshold.
    pub fn start(
        &mut self,
        bus: Arc<BusConnection>,
        blank_after: Option<Duration>,
    ) -> Result<(), IdleTaskError> {
        if self.is_running() {
            return Err(IdleTaskError::AlreadyRunning);
        }

        let mut settings = self.settings.clone();
        if let Some(blank_after) = blank_after {
            validate_blank_after(blank_after)?;
            settings.blank_after = blank_after;
        }

        let probe = (self.probe_factory)();
        let (stop, stop_rx) = mpsc::channel();
        let blank_after_secs = settings.blank_after.as_secs();
        let handle = thread::Builder::new()
            .name("cecd-idle".to_string())
            .spawn(move || run_idle_loop(probe, &bus, &settings, &stop_rx))
            .map_err(IdleTaskError::Spawn)?;

        info!(blank_after_secs, "Idle-screen task started");
        self.task = Some(RunningTask { stop, handle });
        Ok(())
    }

    /// Stops the task and waits for it. Returns `false` if none was running.
    pub fn stop(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        let _ = task.stop.send(());
        match task.handle.join() {
            Ok(exit) => info!(?exit, "Idle-screen task stopped"),
            Err(_) => warn!("Idle-screen task panicked"),
        }
        true
    }

    /// Clears a task that ended on its own.
    pub fn reap(&mut self) {
        if !self.task.as_ref().is_some_and(|task| task.handle.is_finished()) {
            return;
        }
        if let Some(task) = self.task.take() {
            match task.handle.join() {
                Ok(exit) => info!(?exit, "Idle-screen task ended"),
                Err(_) => warn!("Idle-screen task panicked"),
            }
        }
    }
}

impl Drop for IdleController {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_idle_loop(
    mut probe: Box<dyn InputProbe>,
    bus: &BusConnection,
    settings: &IdleSettings,
    stop: &mpsc::Receiver<()>,
) -> IdleExit {
    let mut blanked = false;
    let mut last_idle: Option<Duration> = None;
    let mut failures = 0;

    let exit = loop {
        match probe.idle_time() {
            Ok(idle) => {
                failures = 0;
                if !blanked && idle >= settings.blank_after {
                    info!(idle_secs = idle.as_secs(), "Blanking idle display");
                    blanked = send_frames(bus, &settings.blank_frames, "blank");
                } else if blanked && last_idle.is_some_and(|previous| idle < previous) {
                    info!("Input detected; restoring display");
                    blanked = !send_frames(bus, &settings.wake_frames, "wake");
                }
                last_idle = Some(idle);
            }
            Err(err) => {
                failures += 1;
                warn!(error = %err, failures, "Input probe failed");
                if failures >= settings.max_probe_failures {
                    break IdleExit::ProbeFailed;
                }
            }
        }

        match stop.recv_timeout(settings.poll_interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break IdleExit::Stopped,
        }
    };

    if blanked {
        debug!("Restoring display before idle task exit");
        send_frames(bus, &settings.wake_frames, "wake");
    }
    exit
}

fn send_frames(bus: &BusConnection, frames: &[CecFrame], purpose: &'static str) -> bool {
    match bus.send_all(frames) {
        Ok(_) => true,
        Err(err) => {
            warn!(error = %err, purpose, "Idle-screen send failed");
            false
        }
    }
}
