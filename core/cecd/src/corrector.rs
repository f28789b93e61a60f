//! Signal-path corrector.
//!
//! Watches bus traffic for two ways the TV steals the audio path: switching
//! the soundbar into ARC (system audio mode on), and routing to a known-bad
//! physical address. Both are answered with the same corrective sequence,
//! which re-announces us as the active source.
//!
//! The corrector only decides. The dispatcher sends the planned frames and
//! reports the outcome back through [`Corrector::correction_finished`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cec::{CecFrame, LogicalAddress, Opcode, PhysicalAddress, PhysicalAddressPattern};
use crate::config::CorrectionConfig;
use crate::error::ConfigError;
use crate::trace::TrafficEvent;

const MAX_TRANSITIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Passthrough,
    Arc,
    Transitioning,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Passthrough => "PASSTHROUGH",
            Mode::Arc => "ARC",
            Mode::Transitioning => "TRANSITIONING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    ArcTrip,
    BadRoute,
    Forced,
    Recheck,
}

impl Trigger {
    fn switches_mode(self) -> bool {
        !matches!(self, Trigger::BadRoute)
    }
}

#[derive(Debug, Clone)]
pub struct CorrectorSettings {
    pub enabled: bool,
    pub audio_system: LogicalAddress,
    pub bad_path: PhysicalAddressPattern,
    pub assign_frame: Option<CecFrame>,
    pub activate_frames: Vec<CecFrame>,
    pub debounce: Duration,
    pub transition_timeout: Duration,
    pub retry_delay: Duration,
}

impl CorrectorSettings {
    pub fn from_config(
        config: &CorrectionConfig,
        audio_system_address: u8,
    ) -> Result<Self, ConfigError> {
        let audio_system = LogicalAddress::new(audio_system_address).ok_or_else(|| {
            ConfigError::invalid(
                "bus.audio_system_address",
                format!("{audio_system_address} is not a logical address"),
            )
        })?;
        let bad_path = config
            .bad_physical_address
            .parse()
            .map_err(|err| ConfigError::invalid("correction.bad_physical_address", format!("{err}")))?;
        let assign_frame = config
            .assign_frame
            .as_deref()
            .map(|frame| parse_frame("correction.assign_frame", frame))
            .transpose()?;
        let activate_frames = config
            .activate_frames
            .iter()
            .map(|frame| parse_frame("correction.activate_frames", frame))
            .collect::<Result<Vec<_>, _>>()?;

        if config.enabled && activate_frames.is_empty() {
            return Err(ConfigError::invalid(
                "correction.activate_frames",
                "at least one frame is required while correction is enabled",
            ));
        }

        Ok(Self {
            enabled: config.enabled,
            audio_system,
            bad_path,
            assign_frame,
            activate_frames,
            debounce: Duration::from_millis(config.debounce_ms),
            transition_timeout: Duration::from_millis(config.transition_timeout_ms),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        })
    }
}

pub(crate) fn parse_frame(field: &'static str, text: &str) -> Result<CecFrame, ConfigError> {
    let frame: CecFrame = text
        .parse()
        .map_err(|err| ConfigError::invalid(field, format!("{text:?}: {err}")))?;
    if frame.opcode.is_none() {
        return Err(ConfigError::invalid(field, format!("{text:?} has no opcode")));
    }
    Ok(frame)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionPlan {
    pub trigger: Trigger,
    pub frames: Vec<CecFrame>,
    /// The plan announces our own physical address.
    pub announces: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ignore,
    Coalesced,
    Correct(CorrectionPlan),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    pub at: DateTime<Utc>,
    pub from: Mode,
    pub to: Mode,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectorStatus {
    pub mode: Mode,
    pub corrections: u64,
    pub failures: u64,
    pub coalesced: u64,
    pub last_correction_age_ms: Option<u64>,
    pub own_address_announced: bool,
    pub transitions: Vec<Transition>,
}

pub struct Corrector {
    settings: CorrectorSettings,
    mode: Mode,
    last_correction: Option<Instant>,
    last_correction_failed: bool,
    transition_started: Option<Instant>,
    own_address_announced: bool,
    corrections: u64,
    failures: u64,
    coalesced: u64,
    transitions: VecDeque<Transition>,
}

impl Corrector {
    pub fn new(settings: CorrectorSettings) -> Self {
        Self {
            settings,
            mode: Mode::Passthrough,
            last_correction: None,
            last_correction_failed: false,
            transition_started: None,
            own_address_announced: false,
            corrections: 0,
            failures: 0,
            coalesced: 0,
            transitions: VecDeque::with_capacity(MAX_TRANSITIONS),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn retry_delay(&self) -> Duration {
        self.settings.retry_delay
    }

    pub fn observe(&mut self, event: &TrafficEvent, now: Instant) -> Verdict {
        if !self.settings.enabled {
            return Verdict::Ignore;
        }

        if event.source == self.settings.audio_system {
            match event.system_audio_mode() {
                Some(true) => return self.arc_trip(now),
                Some(false) => {
                    if self.mode != Mode::Passthrough {
                        self.set_mode(Mode::Passthrough, "arc released");
                    }
                    return Verdict::Ignore;
                }
                None => {}
            }
        }

        match bad_route_address(event) {
            Some(address) if self.settings.bad_path.matches(address) => {
                if self.within_debounce(now) {
                    self.coalesce(Trigger::BadRoute);
                    return Verdict::Coalesced;
                }
                info!(%address, source = %event.source, "Bad route detected");
                Verdict::Correct(self.plan(Trigger::BadRoute, now))
            }
            _ => Verdict::Ignore,
        }
    }

    /// Synthetic ARC trip that bypasses debounce.
    pub fn force_passthrough(&mut self, now: Instant) -> Verdict {
        if self.mode != Mode::Arc {
            self.set_mode(Mode::Arc, "forced");
        }
        self.start_transition(Trigger::Forced, now)
    }

    /// Periodic re-check. Retries a correction that failed or timed out once
    /// the debounce window has passed, and expires transitions whose outcome
    /// never arrived.
    pub fn poll(&mut self, now: Instant) -> Verdict {
        if !self.settings.enabled {
            return Verdict::Ignore;
        }

        match self.mode {
            Mode::Transitioning if !self.transition_active(now) => {
                warn!("Correction outcome timed out");
                self.last_correction_failed = true;
                self.set_mode(Mode::Arc, "transition timed out");
                Verdict::Ignore
            }
            Mode::Arc if !self.within_debounce(now) => {
                debug!("Re-checking uncorrected ARC trip");
                self.start_transition(Trigger::Recheck, now)
            }
            _ => Verdict::Ignore,
        }
    }

    pub fn correction_finished(&mut self, plan: &CorrectionPlan, succeeded: bool) {
        if succeeded {
            self.corrections += 1;
            if plan.announces {
                self.own_address_announced = true;
            }
            if plan.trigger.switches_mode() && self.mode == Mode::Transitioning {
                self.set_mode(Mode::Passthrough, "corrected");
            }
            info!(trigger = ?plan.trigger, corrections = self.corrections, "Signal path corrected");
        } else {
            self.failures += 1;
            if plan.trigger.switches_mode() && self.mode == Mode::Transitioning {
                self.set_mode(Mode::Arc, "correction failed");
            }
        }
        self.last_correction_failed = !succeeded;
        self.transition_started = None;
    }

    pub fn status(&self, now: Instant) -> CorrectorStatus {
        CorrectorStatus {
            mode: self.mode,
            corrections: self.corrections,
            failures: self.failures,
            coalesced: self.coalesced,
            last_correction_age_ms: self
                .last_correction
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            own_address_announced: self.own_address_announced,
            transitions: self.transitions.iter().cloned().collect(),
        }
    }

    fn arc_trip(&mut self, now: Instant) -> Verdict {
        if self.mode == Mode::Transitioning && self.transition_active(now) {
            self.coalesce(Trigger::ArcTrip);
            return Verdict::Coalesced;
        }
        if self.within_debounce(now) {
            // A repeat of a trip that was already corrected needs no recheck.
            if self.last_correction_failed || self.mode != Mode::Passthrough {
                self.set_mode(Mode::Arc, "arc trip");
            }
            self.coalesce(Trigger::ArcTrip);
            return Verdict::Coalesced;
        }
        self.set_mode(Mode::Arc, "arc trip");
        self.start_transition(Trigger::ArcTrip, now)
    }

    fn start_transition(&mut self, trigger: Trigger, now: Instant) -> Verdict {
        let plan = self.plan(trigger, now);
        self.transition_started = Some(now);
        self.set_mode(Mode::Transitioning, "correction planned");
        Verdict::Correct(plan)
    }

    fn plan(&mut self, trigger: Trigger, now: Instant) -> CorrectionPlan {
        self.last_correction = Some(now);
        let assign = (!self.own_address_announced)
            .then(|| self.settings.assign_frame.clone())
            .flatten();
        let announces = assign.is_some();
        let frames = assign
            .into_iter()
            .chain(self.settings.activate_frames.iter().cloned())
            .collect();
        CorrectionPlan {
            trigger,
            frames,
            announces,
        }
    }

    fn coalesce(&mut self, trigger: Trigger) {
        self.coalesced += 1;
        debug!(?trigger, mode = self.mode.as_str(), "Coalesced trigger inside debounce window");
    }

    fn within_debounce(&self, now: Instant) -> bool {
        self.last_correction
            .is_some_and(|at| now.saturating_duration_since(at) < self.settings.debounce)
    }

    fn transition_active(&self, now: Instant) -> bool {
        self.transition_started
            .is_some_and(|at| now.saturating_duration_since(at) < self.settings.transition_timeout)
    }

    fn set_mode(&mut self, to: Mode, reason: &'static str) {
        let from = self.mode;
        if from == to {
            return;
        }
        self.mode = to;
        debug!(from = from.as_str(), to = to.as_str(), reason, "Signal path mode changed");
        if self.transitions.len() == MAX_TRANSITIONS {
            self.transitions.pop_front();
        }
        self.transitions.push_back(Transition {
            at: Utc::now(),
            from,
            to,
            reason,
        });
    }
}

/// Target address of a routing opcode, if the event carries one.
fn bad_route_address(event: &TrafficEvent) -> Option<PhysicalAddress> {
    match event.opcode {
        Opcode::ActiveSource | Opcode::SetStreamPath | Opcode::RoutingChange => {
            event.physical_address()
        }
        _ => None,
    }
}
