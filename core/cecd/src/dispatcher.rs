//! Command dispatcher.
//!
//! The one consumer of the daemon's queue. Bus events, client commands and
//! connection alerts are handled strictly in arrival order on this thread,
//! which owns the corrector and the last known audio status. Every bus write
//! still goes through the connection's send lock, shared with the idle task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use cecd_protocol::{Command, CommandKind, Reply};

use crate::bus::{BusConnection, LinkState};
use crate::cec::{
    CecFrame, LogicalAddress, Opcode, PhysicalAddress, KEY_MUTE, KEY_VOLUME_DOWN, KEY_VOLUME_UP,
};
use crate::channel::ReplyWriter;
use crate::corrector::{CorrectionPlan, Corrector, Verdict};
use crate::error::{IdleTaskError, ParseError, SendError};
use crate::idle::IdleController;
use crate::trace::{AudioStatus, TrafficEvent};

pub const TICK_INTERVAL: Duration = Duration::from_millis(250);
pub const MAX_VOLUME_STEPS: u32 = 20;

#[derive(Debug)]
pub enum DispatchItem {
    Bus(TrafficEvent),
    Client(Command),
    ConnectionLost(String),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded(String),
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub own_address: LogicalAddress,
    pub own_physical_address: PhysicalAddress,
    pub audio_system: LogicalAddress,
    pub reply_max_age: Duration,
}

pub struct Dispatcher {
    bus: Arc<BusConnection>,
    corrector: Corrector,
    idle: IdleController,
    replies: ReplyWriter,
    settings: DispatcherSettings,
    stop: Arc<AtomicBool>,
    audio: AudioStatus,
    audio_updated_at: Option<DateTime<Utc>>,
    /// Last device seen announcing itself as active source.
    active_source: Option<LogicalAddress>,
    correction_error: Option<String>,
    commands_handled: u64,
    started: Instant,
}

impl Dispatcher {
    pub fn new(
        bus: Arc<BusConnection>,
        corrector: Corrector,
        idle: IdleController,
        replies: ReplyWriter,
        settings: DispatcherSettings,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bus,
            corrector,
            idle,
            replies,
            settings,
            stop,
            audio: AudioStatus::default(),
            audio_updated_at: None,
            active_source: None,
            correction_error: None,
            commands_handled: 0,
            started: Instant::now(),
        }
    }

    /// Drains the queue until shutdown, then releases the idle task and the
    /// bus.
    pub fn run(mut self, queue: Receiver<DispatchItem>) {
        let mut next_tick = Instant::now() + TICK_INTERVAL;
        loop {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match queue.recv_timeout(wait) {
                Ok(DispatchItem::Shutdown) => break,
                Ok(item) => self.handle(item),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("Dispatch queue closed");
                    break;
                }
            }

            let now = Instant::now();
            if now >= next_tick {
                self.tick(now);
                next_tick = now + TICK_INTERVAL;
            }
        }

        info!(commands = self.commands_handled, "Dispatcher stopping");
        self.idle.stop();
        self.bus.disconnect();
    }

    pub fn handle(&mut self, item: DispatchItem) {
        match item {
            DispatchItem::Bus(event) => self.handle_event(&event),
            DispatchItem::Client(command) => {
                let reply = self.execute(&command);
                self.commands_handled += 1;
                debug!(request_id = %command.request_id, kind = %command.kind, ok = reply.is_ok(), "Command handled");
                if let Err(err) = self.replies.write(&command.request_id, &reply) {
                    warn!(error = %err, "Failed to deliver reply");
                }
            }
            DispatchItem::ConnectionLost(reason) => {
                warn!(reason, "Bus connection lost");
                self.bus.mark_down();
                self.recover_link(&reason);
            }
            DispatchItem::Shutdown => {}
        }

        // A send that hit a dead adapter leaves the link down.
        self.recover_link("send failed");
    }

    pub fn tick(&mut self, now: Instant) {
        if self.bus.link_state() == LinkState::Connected {
            let verdict = self.corrector.poll(now);
            self.apply(verdict);
        }
        self.replies.prune(self.settings.reply_max_age);
        self.idle.reap();
    }

    fn handle_event(&mut self, event: &TrafficEvent) {
        if event.source == self.settings.audio_system {
            if let Some(status) = event.audio_status() {
                debug!(volume = ?status.volume, muted = status.muted, "Audio status updated");
                self.audio = status;
                self.audio_updated_at = Some(Utc::now());
            }
        }
        match event.opcode {
            Opcode::ActiveSource => self.active_source = Some(event.source),
            Opcode::InactiveSource if self.active_source == Some(event.source) => {
                self.active_source = None
            }
            _ => {}
        }
        let verdict = self.corrector.observe(event, Instant::now());
        self.apply(verdict);
    }

    /// Our own source announcements do not come back as bus events.
    fn note_sent(&mut self, frames: &[CecFrame]) {
        let own = self.settings.own_address;
        for frame in frames.iter().filter(|frame| frame.initiator == own) {
            match frame.opcode {
                Some(Opcode::ActiveSource) => self.active_source = Some(own),
                Some(Opcode::InactiveSource) if self.active_source == Some(own) => {
                    self.active_source = None
                }
                _ => {}
            }
        }
    }

    fn apply(&mut self, verdict: Verdict) -> bool {
        match verdict {
            Verdict::Correct(plan) => self.run_correction(&plan),
            Verdict::Coalesced | Verdict::Ignore => true,
        }
    }

    /// Sends a corrective sequence, retrying once.
    fn run_correction(&mut self, plan: &CorrectionPlan) -> bool {
        let mut result = self.bus.send_all(&plan.frames);
        if let Err(err) = &result {
            warn!(error = %err, trigger = ?plan.trigger, "Corrective send failed; retrying once");
            if *err != SendError::Disconnected {
                thread::sleep(self.corrector.retry_delay());
                result = self.bus.send_all(&plan.frames);
            }
        }

        match result {
            Ok(ack) => {
                self.note_sent(&plan.frames);
                debug!(
                    trigger = ?plan.trigger,
                    frames = ack.frames,
                    attempts = ack.attempts,
                    "Corrective sequence sent"
                );
                self.corrector.correction_finished(plan, true);
                if self.correction_error.take().is_some() {
                    info!("Signal path correction recovered");
                }
                true
            }
            Err(err) => {
                error!(error = %err, trigger = ?plan.trigger, "Signal path correction failed");
                self.corrector.correction_finished(plan, false);
                self.correction_error = Some(format!("correction failed: {err}"));
                false
            }
        }
    }

    fn recover_link(&mut self, reason: &str) {
        if self.bus.link_state() != LinkState::Down {
            return;
        }
        match self.bus.reconnect(&self.stop) {
            Ok(()) => info!(reason, "Bus link recovered"),
            Err(err) => error!(error = %err, "Bus link not recovered; running degraded"),
        }
    }

    pub fn health(&self) -> Health {
        match self.bus.link_state() {
            LinkState::Lost => return Health::Degraded("bus unavailable".to_string()),
            LinkState::Down | LinkState::Reconnecting => {
                return Health::Degraded("bus reconnecting".to_string())
            }
            LinkState::Connected | LinkState::Closed => {}
        }
        match &self.correction_error {
            Some(reason) => Health::Degraded(reason.clone()),
            None => Health::Healthy,
        }
    }

    pub fn execute(&mut self, command: &Command) -> Reply {
        let link = self.bus.link_state();
        if command.kind.touches_bus() && link != LinkState::Connected {
            return Reply::error(format!("bus unavailable (link {})", link.as_str()));
        }

        let payload = command.payload.as_deref();
        match command.kind {
            CommandKind::VolumeUp => self.volume_keys(KEY_VOLUME_UP, payload),
            CommandKind::VolumeDown => self.volume_keys(KEY_VOLUME_DOWN, payload),
            CommandKind::Mute => self.volume_keys(KEY_MUTE, None),
            CommandKind::ForcePassthrough => {
                let verdict = self.corrector.force_passthrough(Instant::now());
                if self.apply(verdict) {
                    Reply::ok_with(self.corrector.mode().as_str())
                } else {
                    Reply::error(format!(
                        "correction failed; mode {}",
                        self.corrector.mode().as_str()
                    ))
                }
            }
            CommandKind::StatusQuery => Reply::ok_with(self.status_json().to_string()),
            CommandKind::StartIdleTask => self.start_idle(payload),
            CommandKind::StopIdleTask => {
                if self.idle.stop() {
                    Reply::ok_with("stopped")
                } else {
                    Reply::ok_with("not running")
                }
            }
            CommandKind::Standby => self.addressed(Opcode::Standby, payload),
            CommandKind::PowerOn => self.addressed(Opcode::ImageViewOn, payload),
            CommandKind::ActiveSource => {
                let frame = self.source_frame(LogicalAddress::BROADCAST, Opcode::ActiveSource);
                self.send_reply(&[frame], None)
            }
            CommandKind::InactiveSource => {
                let frame = self.source_frame(LogicalAddress::TV, Opcode::InactiveSource);
                self.send_reply(&[frame], None)
            }
            CommandKind::SleepTv => self.sleep_tv(),
            CommandKind::Transmit => match payload.unwrap_or_default().parse::<CecFrame>() {
                Ok(frame) => self.send_reply(&[frame], None),
                Err(err) => Reply::error(err.to_string()),
            },
        }
    }

    fn volume_keys(&mut self, key: u8, payload: Option<&str>) -> Reply {
        let steps = match parse_steps(payload) {
            Ok(steps) => steps,
            Err(err) => return Reply::error(err.to_string()),
        };

        let own = self.settings.own_address;
        let audio = self.settings.audio_system;
        let mut frames = Vec::with_capacity(steps as usize * 2 + 1);
        for _ in 0..steps {
            frames.push(CecFrame::user_control_pressed(own, audio, key));
            frames.push(CecFrame::user_control_released(own, audio));
        }
        frames.push(CecFrame::new(own, audio, Opcode::GiveAudioStatus, Vec::new()));

        let volume = match self.audio.volume {
            Some(volume) => volume.to_string(),
            None => "unknown".to_string(),
        };
        self.send_reply(&frames, Some(volume))
    }

    fn addressed(&mut self, opcode: Opcode, payload: Option<&str>) -> Reply {
        let destination = match payload {
            None => LogicalAddress::TV,
            Some(value) => match value.trim().parse::<LogicalAddress>() {
                Ok(address) => address,
                Err(err) => return Reply::error(err.to_string()),
            },
        };
        let frame = CecFrame::new(self.settings.own_address, destination, opcode, Vec::new());
        self.send_reply(&[frame], None)
    }

    /// Source announcement carrying our own physical address.
    fn source_frame(&self, destination: LogicalAddress, opcode: Opcode) -> CecFrame {
        CecFrame::new(
            self.settings.own_address,
            destination,
            opcode,
            self.settings.own_physical_address.to_bytes().to_vec(),
        )
    }

    /// Puts the TV into standby and gives up the source, but only while we
    /// are the active source.
    fn sleep_tv(&mut self) -> Reply {
        let own = self.settings.own_address;
        if self.active_source != Some(own) {
            debug!(active_source = ?self.active_source, "Not the active source; leaving TV on");
            return Reply::ok_with("not active source");
        }
        let frames = [
            CecFrame::new(own, LogicalAddress::TV, Opcode::Standby, Vec::new()),
            self.source_frame(LogicalAddress::TV, Opcode::InactiveSource),
        ];
        self.send_reply(&frames, Some("standby".to_string()))
    }

    fn send_reply(&mut self, frames: &[CecFrame], data: Option<String>) -> Reply {
        match self.bus.send_all(frames) {
            Ok(_) => {
                self.note_sent(frames);
                match data {
                    Some(data) => Reply::ok_with(data),
                    None => Reply::ok(),
                }
            }
            Err(SendError::Disconnected) => Reply::error("bus unavailable (link down)"),
            Err(err) => Reply::error(format!("send failed: {err}")),
        }
    }

    fn start_idle(&mut self, payload: Option<&str>) -> Reply {
        let blank_after = match payload.map(str::trim).map(str::parse::<u64>) {
            None => None,
            Some(Ok(secs)) => Some(Duration::from_secs(secs)),
            Some(Err(_)) => {
                return Reply::error(format!(
                    "invalid idle timeout {:?} (seconds expected)",
                    payload.unwrap_or_default()
                ))
            }
        };
        match self.idle.start(Arc::clone(&self.bus), blank_after) {
            Ok(()) => Reply::ok_with("started"),
            Err(err @ (IdleTaskError::AlreadyRunning | IdleTaskError::InvalidTimeout(_))) => {
                Reply::error(err.to_string())
            }
            Err(err) => {
                error!(error = %err, "Failed to start idle-screen task");
                Reply::error(err.to_string())
            }
        }
    }

    fn status_json(&mut self) -> serde_json::Value {
        let now = Instant::now();
        let corrector = self.corrector.status(now);
        let idle_task = if self.idle.is_running() {
            "running"
        } else {
            "stopped"
        };
        json!({
            "mode": corrector.mode,
            "volume": self.audio.volume,
            "muted": self.audio.muted,
            "audio_updated_at": self.audio_updated_at,
            "link": self.bus.link_state(),
            "health": self.health(),
            "idle_task": idle_task,
            "corrections": corrector.corrections,
            "correction_failures": corrector.failures,
            "coalesced": corrector.coalesced,
            "last_correction_age_ms": corrector.last_correction_age_ms,
            "active_source": self.active_source,
            "own_address_announced": corrector.own_address_announced,
            "transitions": corrector.transitions,
            "frames_sent": self.bus.frames_sent(),
            "commands_handled": self.commands_handled,
            "uptime_secs": now.duration_since(self.started).as_secs(),
        })
    }
}

/// Press count for the volume keys: 1 by default, at most 20.
fn parse_steps(payload: Option<&str>) -> Result<u32, ParseError> {
    let Some(value) = payload else {
        return Ok(1);
    };
    let invalid = || ParseError::Payload {
        field: "step count",
        value: value.to_string(),
    };
    let steps: u32 = value.trim().parse().map_err(|_| invalid())?;
    if (1..=MAX_VOLUME_STEPS).contains(&steps) {
        Ok(steps)
    } else {
        Err(invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::ReconnectPolicy;
    use crate::bus::fake::FakeBus;
    use crate::bus::{HandlerRegistry, SendPolicy};
    use crate::config::{CorrectionConfig, IdleConfig};
    use crate::corrector::CorrectorSettings;
    use crate::error::{ProbeError, TransmitError};
    use crate::idle::{IdleSettings, InputProbe};
    use crate::trace;
    use serde_json::Value;
    use std::sync::mpsc;
    use tempfile::TempDir;

    struct NeverIdle;

    impl InputProbe for NeverIdle {
        fn idle_time(&mut self) -> Result<Duration, ProbeError> {
            Ok(Duration::ZERO)
        }
    }

    struct Harness {
        fake: FakeBus,
        dispatcher: Dispatcher,
        replies: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            let fake = FakeBus::new();
            let bus = BusConnection::connect(
                fake.adapter(),
                Arc::new(HandlerRegistry::new()),
                SendPolicy {
                    retries: 1,
                    retry_delay: Duration::from_millis(1),
                },
                ReconnectPolicy {
                    attempts: 2,
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(2),
                },
            )
            .unwrap();
            let corrector = Corrector::new(
                CorrectorSettings::from_config(
                    &CorrectionConfig {
                        retry_delay_ms: 1,
                        ..CorrectionConfig::default()
                    },
                    5,
                )
                .unwrap(),
            );
            let idle = IdleController::new(
                IdleSettings::from_config(&IdleConfig {
                    poll_interval_ms: 5,
                    ..IdleConfig::default()
                })
                .unwrap(),
                Box::new(|| Box::new(NeverIdle) as Box<dyn InputProbe>),
            );
            let replies = TempDir::new().unwrap();
            let dispatcher = Dispatcher::new(
                Arc::new(bus),
                corrector,
                idle,
                ReplyWriter::new(replies.path().to_path_buf()),
                DispatcherSettings {
                    own_address: LogicalAddress::RECORDING_1,
                    own_physical_address: "1100".parse().unwrap(),
                    audio_system: LogicalAddress::AUDIO_SYSTEM,
                    reply_max_age: Duration::from_secs(300),
                },
                Arc::new(AtomicBool::new(false)),
            );
            Self {
                fake,
                dispatcher,
                replies,
            }
        }

        fn command(&mut self, id: &str, kind: CommandKind, payload: Option<&str>) -> Reply {
            let command = Command::new(kind, id, payload.map(str::to_string)).unwrap();
            self.dispatcher.handle(DispatchItem::Client(command));
            let content = std::fs::read_to_string(self.replies.path().join(id)).unwrap();
            Reply::parse(&content).unwrap()
        }

        fn event(&mut self, line: &str) {
            let event = trace::parse(line).unwrap();
            self.dispatcher.handle(DispatchItem::Bus(event));
        }

        fn status(&mut self) -> Value {
            let reply = self.command("status", CommandKind::StatusQuery, None);
            serde_json::from_str(reply.data().unwrap()).unwrap()
        }
    }

    #[test]
    fn volume_up_then_audio_report_shows_in_status() {
        let mut h = Harness::new();

        let reply = h.command("v1", CommandKind::VolumeUp, None);
        assert_eq!(reply, Reply::ok_with("unknown"));
        assert_eq!(h.fake.sent(), vec!["15:44:41", "15:45", "15:71"]);

        h.event("51:7a:22");
        let status = h.status();
        assert_eq!(status["volume"], 34);
        assert_eq!(status["muted"], false);
        assert_eq!(status["mode"], "PASSTHROUGH");
        assert_eq!(status["link"], "connected");
        assert_eq!(status["health"]["status"], "healthy");

        let reply = h.command("v2", CommandKind::VolumeDown, Some("2"));
        assert_eq!(reply, Reply::ok_with("34"));
    }

    #[test]
    fn step_counts_are_bounded() {
        let mut h = Harness::new();
        assert!(!h.command("a", CommandKind::VolumeUp, Some("0")).is_ok());
        assert!(!h.command("b", CommandKind::VolumeUp, Some("21")).is_ok());
        assert!(!h.command("c", CommandKind::VolumeUp, Some("lots")).is_ok());
        assert!(h.fake.sent().is_empty());

        assert!(h.command("d", CommandKind::VolumeDown, Some("3")).is_ok());
        assert_eq!(h.fake.sent().len(), 7);
    }

    #[test]
    fn arc_trip_from_bus_is_corrected() {
        let mut h = Harness::new();
        h.event("5f:72:01");
        assert_eq!(h.fake.sent(), vec!["1f:84:11:00:01", "1f:82:11:00"]);

        let status = h.status();
        assert_eq!(status["mode"], "PASSTHROUGH");
        assert_eq!(status["corrections"], 1);
        assert_eq!(status["own_address_announced"], true);
        assert_eq!(status["transitions"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn repeated_trip_inside_window_sends_one_sequence() {
        let mut h = Harness::new();
        h.event("5f:72:01");
        h.event("5f:72:01");
        h.dispatcher.tick(Instant::now() + Duration::from_secs(3));
        h.dispatcher.tick(Instant::now() + Duration::from_secs(6));

        assert_eq!(h.fake.sent(), vec!["1f:84:11:00:01", "1f:82:11:00"]);
        let status = h.status();
        assert_eq!(status["mode"], "PASSTHROUGH");
        assert_eq!(status["corrections"], 1);
        assert_eq!(status["coalesced"], 1);
    }

    #[test]
    fn failed_correction_is_retried_then_degrades() {
        let mut h = Harness::new();
        for _ in 0..2 {
            h.fake.push_transmit_error(TransmitError::Failed("nack".to_string()));
        }

        let reply = h.command("f", CommandKind::ForcePassthrough, None);
        assert!(!reply.is_ok());
        let status = h.status();
        assert_eq!(status["mode"], "ARC");
        assert_eq!(status["health"]["status"], "degraded");

        let reply = h.command("g", CommandKind::ForcePassthrough, None);
        assert_eq!(reply, Reply::ok_with("PASSTHROUGH"));
        assert_eq!(h.status()["health"]["status"], "healthy");
    }

    #[test]
    fn first_failure_recovers_on_retry() {
        let mut h = Harness::new();
        h.fake.push_transmit_error(TransmitError::Failed("nack".to_string()));

        let reply = h.command("f", CommandKind::ForcePassthrough, None);
        assert_eq!(reply, Reply::ok_with("PASSTHROUGH"));
        assert_eq!(h.fake.sent(), vec!["1f:84:11:00:01", "1f:82:11:00"]);
    }

    #[test]
    fn lost_bus_degrades_but_keeps_answering() {
        let mut h = Harness::new();
        h.fake.fail_opens(10);
        h.dispatcher
            .handle(DispatchItem::ConnectionLost("adapter output closed".to_string()));

        let reply = h.command("v", CommandKind::VolumeUp, None);
        assert_eq!(reply, Reply::error("bus unavailable (link lost)"));

        let status = h.status();
        assert_eq!(status["link"], "lost");
        assert_eq!(status["health"]["reason"], "bus unavailable");

        assert_eq!(
            h.command("i", CommandKind::StartIdleTask, None),
            Reply::ok_with("started")
        );
        assert_eq!(
            h.command("j", CommandKind::StopIdleTask, None),
            Reply::ok_with("stopped")
        );
    }

    #[test]
    fn connection_loss_reconnects() {
        let mut h = Harness::new();
        h.fake.fail_opens(1);
        h.dispatcher
            .handle(DispatchItem::ConnectionLost("adapter output closed".to_string()));
        assert_eq!(h.status()["link"], "connected");
        assert!(h.command("m", CommandKind::Mute, None).is_ok());
        assert_eq!(h.fake.sent(), vec!["15:44:43", "15:45", "15:71"]);
    }

    #[test]
    fn idle_task_start_stop_contract() {
        let mut h = Harness::new();
        assert_eq!(
            h.command("s1", CommandKind::StartIdleTask, Some("30")),
            Reply::ok_with("started")
        );
        assert_eq!(
            h.command("s2", CommandKind::StartIdleTask, None),
            Reply::error("idle-screen task is already running")
        );
        assert_eq!(h.status()["idle_task"], "running");
        assert_eq!(
            h.command("s3", CommandKind::StopIdleTask, None),
            Reply::ok_with("stopped")
        );
        assert_eq!(
            h.command("s4", CommandKind::StopIdleTask, None),
            Reply::ok_with("not running")
        );
        assert!(!h.command("s5", CommandKind::StartIdleTask, Some("soon")).is_ok());
    }

    #[test]
    fn addressed_and_raw_commands() {
        let mut h = Harness::new();
        assert!(h.command("a", CommandKind::Standby, None).is_ok());
        assert!(h.command("b", CommandKind::PowerOn, Some("4")).is_ok());
        assert!(h.command("c", CommandKind::Transmit, Some("1f:82:11:00")).is_ok());
        assert!(!h.command("d", CommandKind::Transmit, Some("nonsense")).is_ok());
        assert!(!h.command("e", CommandKind::Standby, Some("16")).is_ok());
        assert_eq!(h.fake.sent(), vec!["10:36", "14:04", "1f:82:11:00"]);
    }

    #[test]
    fn source_announcements_carry_own_physical_address() {
        let mut h = Harness::new();
        assert_eq!(h.command("a", CommandKind::ActiveSource, None), Reply::ok());
        assert_eq!(h.status()["active_source"], 1);

        assert_eq!(h.command("b", CommandKind::InactiveSource, None), Reply::ok());
        assert_eq!(h.status()["active_source"], Value::Null);
        assert_eq!(h.fake.sent(), vec!["1f:82:11:00", "10:9d:11:00"]);
    }

    #[test]
    fn sleep_tv_only_when_active_source() {
        let mut h = Harness::new();
        assert_eq!(
            h.command("a", CommandKind::SleepTv, None),
            Reply::ok_with("not active source")
        );

        h.event("4f:82:21:00");
        assert_eq!(h.status()["active_source"], 4);
        assert_eq!(
            h.command("b", CommandKind::SleepTv, None),
            Reply::ok_with("not active source")
        );
        assert!(h.fake.sent().is_empty());

        // A corrective sequence makes us the active source again.
        h.event("5f:72:01");
        assert_eq!(h.status()["active_source"], 1);
        assert_eq!(
            h.command("c", CommandKind::SleepTv, None),
            Reply::ok_with("standby")
        );
        assert_eq!(
            h.fake.sent(),
            vec!["1f:84:11:00:01", "1f:82:11:00", "10:36", "10:9d:11:00"]
        );
        assert_eq!(h.status()["active_source"], Value::Null);
    }

    #[test]
    fn other_device_going_inactive_clears_active_source() {
        let mut h = Harness::new();
        h.event("4f:82:21:00");
        h.event("40:9d:21:00");
        assert_eq!(h.status()["active_source"], Value::Null);
    }

    #[test]
    fn run_loop_exits_on_shutdown() {
        let h = Harness::new();
        let fake = h.fake.clone();
        let (tx, rx) = mpsc::sync_channel(4);
        tx.send(DispatchItem::Bus(trace::parse("5f:72:01").unwrap()))
            .unwrap();
        tx.send(DispatchItem::Shutdown).unwrap();

        h.dispatcher.run(rx);
        assert_eq!(fake.sent().len(), 2);
        assert_eq!(fake.closes(), 1);
    }
}
