//! Command channel protocol for cecd.
//!
//! This crate is shared by the daemon and its clients so both sides agree on
//! the wire format. The daemon remains the authority on validation, but
//! clients use the same types to build requests that will be accepted.
//!
//! Requests travel over a named pipe, one per line:
//!
//! ```text
//! <request_id> <KIND>[:<payload>]\n
//! ```
//!
//! Replies are delivered out of band in `replies/<request_id>` as
//! `OK[:<data>]\n` or `ERROR:<message>\n`.

pub mod client;
pub mod lock;

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Single FIFO writes up to PIPE_BUF are atomic; keep every record below it.
pub const MAX_REQUEST_BYTES: usize = 512;
pub const MAX_REQUEST_ID_LEN: usize = 64;

pub const REQUEST_PIPE_NAME: &str = "request.fifo";
pub const LOCK_FILE_NAME: &str = "request.lock";
pub const REPLIES_DIR_NAME: &str = "replies";
pub const RUNTIME_DIR_ENV: &str = "CECD_RUNTIME_DIR";
pub const DEFAULT_RUNTIME_DIR: &str = "/run/cecd";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("request was empty")]
    Empty,

    #[error("request of {0} bytes exceeds the {MAX_REQUEST_BYTES} byte limit")]
    TooLarge(usize),

    #[error("invalid request id {0:?}")]
    InvalidRequestId(String),

    #[error("request has no command kind")]
    MissingKind,

    #[error("unknown command {0:?}")]
    UnknownKind(String),

    #[error("{0} requires a payload")]
    MissingPayload(CommandKind),

    #[error("{0} does not take a payload")]
    UnexpectedPayload(CommandKind),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("malformed reply {0:?}")]
    MalformedReply(String),
}

/// A request that failed validation, with the id when it could be recovered
/// so the daemon can still address an error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub request_id: Option<String>,
    pub error: ProtocolError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    VolumeUp,
    VolumeDown,
    Mute,
    ForcePassthrough,
    StatusQuery,
    StartIdleTask,
    StopIdleTask,
    Standby,
    PowerOn,
    ActiveSource,
    InactiveSource,
    SleepTv,
    Transmit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadRule {
    Forbidden,
    Optional,
    Required,
}

impl CommandKind {
    pub const ALL: [CommandKind; 13] = [
        CommandKind::VolumeUp,
        CommandKind::VolumeDown,
        CommandKind::Mute,
        CommandKind::ForcePassthrough,
        CommandKind::StatusQuery,
        CommandKind::StartIdleTask,
        CommandKind::StopIdleTask,
        CommandKind::Standby,
        CommandKind::PowerOn,
        CommandKind::ActiveSource,
        CommandKind::InactiveSource,
        CommandKind::SleepTv,
        CommandKind::Transmit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::VolumeUp => "VOLUME_UP",
            CommandKind::VolumeDown => "VOLUME_DOWN",
            CommandKind::Mute => "MUTE",
            CommandKind::ForcePassthrough => "FORCE_PASSTHROUGH",
            CommandKind::StatusQuery => "STATUS_QUERY",
            CommandKind::StartIdleTask => "START_IDLE_TASK",
            CommandKind::StopIdleTask => "STOP_IDLE_TASK",
            CommandKind::Standby => "STANDBY",
            CommandKind::PowerOn => "POWER_ON",
            CommandKind::ActiveSource => "ACTIVE_SOURCE",
            CommandKind::InactiveSource => "INACTIVE_SOURCE",
            CommandKind::SleepTv => "SLEEP_TV",
            CommandKind::Transmit => "TRANSMIT",
        }
    }

    /// Tags are matched case-insensitively.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(tag))
    }

    pub fn payload_rule(self) -> PayloadRule {
        match self {
            CommandKind::StatusQuery
            | CommandKind::StopIdleTask
            | CommandKind::Mute
            | CommandKind::ForcePassthrough
            | CommandKind::ActiveSource
            | CommandKind::InactiveSource
            | CommandKind::SleepTv => PayloadRule::Forbidden,
            CommandKind::VolumeUp
            | CommandKind::VolumeDown
            | CommandKind::StartIdleTask
            | CommandKind::Standby
            | CommandKind::PowerOn => PayloadRule::Optional,
            CommandKind::Transmit => PayloadRule::Required,
        }
    }

    /// Whether executing the command needs a live bus link.
    pub fn touches_bus(self) -> bool {
        !matches!(
            self,
            CommandKind::StatusQuery | CommandKind::StartIdleTask | CommandKind::StopIdleTask
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub request_id: String,
    pub payload: Option<String>,
}

impl Command {
    pub fn new(
        kind: CommandKind,
        request_id: impl Into<String>,
        payload: Option<String>,
    ) -> Result<Self, ProtocolError> {
        let request_id = request_id.into();
        validate_request_id(&request_id)?;
        validate_payload(kind, payload.as_deref())?;
        Ok(Self {
            kind,
            request_id,
            payload,
        })
    }

    /// Wire record including the trailing newline.
    pub fn encode(&self) -> String {
        match &self.payload {
            Some(payload) => format!("{} {}:{}\n", self.request_id, self.kind, payload),
            None => format!("{} {}\n", self.request_id, self.kind),
        }
    }
}

pub fn parse_request_line(line: &str) -> Result<Command, RequestError> {
    let without_newline = line.trim_end_matches(['\n', '\r']);
    if without_newline.len() > MAX_REQUEST_BYTES {
        return Err(RequestError {
            request_id: None,
            error: ProtocolError::TooLarge(without_newline.len()),
        });
    }

    let trimmed = without_newline.trim();
    if trimmed.is_empty() {
        return Err(RequestError {
            request_id: None,
            error: ProtocolError::Empty,
        });
    }

    let (id, body) = match trimmed.split_once(' ') {
        Some((id, body)) => (id, body.trim()),
        None => (trimmed, ""),
    };

    if let Err(error) = validate_request_id(id) {
        return Err(RequestError {
            request_id: None,
            error,
        });
    }

    let with_id = |error| RequestError {
        request_id: Some(id.to_string()),
        error,
    };

    if body.is_empty() {
        return Err(with_id(ProtocolError::MissingKind));
    }

    let (tag, payload) = match body.split_once(':') {
        Some((tag, payload)) => (tag, Some(payload)),
        None => (body, None),
    };

    let kind =
        CommandKind::from_tag(tag).ok_or_else(|| with_id(ProtocolError::UnknownKind(tag.to_string())))?;

    Command::new(kind, id, payload.map(str::to_string)).map_err(with_id)
}

pub fn validate_request_id(id: &str) -> Result<(), ProtocolError> {
    let valid = !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(ProtocolError::InvalidRequestId(id.to_string()))
    }
}

fn validate_payload(kind: CommandKind, payload: Option<&str>) -> Result<(), ProtocolError> {
    match (kind.payload_rule(), payload) {
        (PayloadRule::Forbidden, Some(_)) => Err(ProtocolError::UnexpectedPayload(kind)),
        (PayloadRule::Required, None) => Err(ProtocolError::MissingPayload(kind)),
        (_, Some(value)) if value.trim().is_empty() => {
            Err(ProtocolError::InvalidPayload("payload is empty".to_string()))
        }
        (_, Some(value)) if value.chars().any(char::is_control) => Err(
            ProtocolError::InvalidPayload("payload contains control characters".to_string()),
        ),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Option<String>),
    Error(String),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Ok(None)
    }

    pub fn ok_with(data: impl Into<String>) -> Self {
        Reply::Ok(Some(data.into()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Reply::Error(message.into())
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok(_))
    }

    pub fn data(&self) -> Option<&str> {
        match self {
            Reply::Ok(data) => data.as_deref(),
            Reply::Error(_) => None,
        }
    }

    /// Wire record including the trailing newline.
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line == "OK" {
            return Ok(Reply::Ok(None));
        }
        if let Some(data) = line.strip_prefix("OK:") {
            return Ok(Reply::Ok(Some(data.to_string())));
        }
        if let Some(message) = line.strip_prefix("ERROR:") {
            return Ok(Reply::Error(message.to_string()));
        }
        Err(ProtocolError::MalformedReply(line.to_string()))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ok(None) => f.write_str("OK"),
            Reply::Ok(Some(data)) => write!(f, "OK:{}", single_line(data)),
            Reply::Error(message) => write!(f, "ERROR:{}", single_line(message)),
        }
    }
}

fn single_line(value: &str) -> String {
    value.replace(['\n', '\r'], " ")
}

/// Filesystem layout of the command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    dir: PathBuf,
}

impl ChannelPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_env() -> Self {
        match env::var_os(RUNTIME_DIR_ENV) {
            Some(dir) if !dir.is_empty() => Self::new(dir),
            _ => Self::new(DEFAULT_RUNTIME_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn request_pipe(&self) -> PathBuf {
        self.dir.join(REQUEST_PIPE_NAME)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    pub fn replies_dir(&self) -> PathBuf {
        self.dir.join(REPLIES_DIR_NAME)
    }

    pub fn reply_file(&self, request_id: &str) -> PathBuf {
        self.replies_dir().join(request_id)
    }
}
