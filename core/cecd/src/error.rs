//! Error types for the daemon.
//!
//! External input (trace lines, client payloads, config) fails with
//! `ParseError`/`ConfigError` and is rejected locally. Bus failures
//! (`ConnectionError`, `SendError`) degrade the daemon instead of ending it.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame is empty")]
    Empty,

    #[error("invalid frame header {0:?} (expected two hex nibbles)")]
    BadHeader(String),

    #[error("invalid byte {token:?} at position {index}")]
    BadByte { index: usize, token: String },

    #[error("frame carries {0} parameter bytes (max 14)")]
    TooManyParams(usize),

    #[error("frame has no opcode")]
    MissingOpcode,

    #[error("invalid logical address {0:?}")]
    LogicalAddress(String),

    #[error("invalid physical address {0:?}")]
    PhysicalAddress(String),

    #[error("invalid physical address pattern {0:?}")]
    AddressPattern(String),

    #[error("invalid {field} payload {value:?}")]
    Payload { field: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("CEC adapter unavailable: {0}")]
    Unavailable(String),

    #[error("CEC adapter exited during startup: {0}")]
    ExitedEarly(String),

    #[error("reconnect gave up after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },

    #[error("reconnect interrupted by shutdown")]
    Interrupted,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("bus link is down")]
    Disconnected,

    #[error("bus stayed busy after {attempts} attempts: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    #[error("bus write failed: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("cecd is already running with pid {pid}")]
    AlreadyRunning { pid: u32 },

    #[error("failed to manage pid file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to prepare channel directory {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create request pipe {path}: {source}")]
    CreatePipe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write reply {path}: {source}")]
    Reply {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-adapter transmit failure, before retry policy is applied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransmitError {
    #[error("bus busy: {0}")]
    Busy(String),

    #[error("adapter disconnected: {0}")]
    Disconnected(String),

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum IdleTaskError {
    #[error("idle-screen task is already running")]
    AlreadyRunning,

    #[error("failed to spawn idle-screen task: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("invalid idle timeout {0:?}")]
    InvalidTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run input probe {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("input probe exited with {0}")]
    Failed(String),

    #[error("unexpected input probe output {0:?}")]
    Output(String),
}

/// Startup failures that end the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}
