//! Ownership of the CEC bus.
//!
//! The adapter is the only handle on the hardware. [`BusConnection`] wraps it
//! in a single send lock and owns the callback registration table; every
//! writer in the process (dispatcher, corrector, idle task) goes through it.

mod cec_client;
mod connection;
mod registry;

#[cfg(test)]
pub mod fake;

pub use cec_client::CecClientAdapter;
pub use connection::{Ack, BusConnection, LinkState, SendPolicy};
pub use registry::HandlerRegistry;

use std::sync::Arc;

use crate::cec::CecFrame;
use crate::error::{ConnectionError, TransmitError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Traffic,
    Log,
    Alert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Notice,
    Traffic,
    Debug,
}

/// Something the adapter observed, delivered from its reader thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusNotification {
    /// A received frame in trace notation, direction marker stripped.
    Traffic(String),
    Log { level: LogLevel, message: String },
    ConnectionLost(String),
}

impl BusNotification {
    pub fn category(&self) -> EventCategory {
        match self {
            BusNotification::Traffic(_) => EventCategory::Traffic,
            BusNotification::Log { .. } => EventCategory::Log,
            BusNotification::ConnectionLost(_) => EventCategory::Alert,
        }
    }
}

pub trait BusAdapter: Send {
    /// Acquires the hardware. Notifications flow into `registry` until close.
    fn open(&mut self, registry: Arc<HandlerRegistry>) -> Result<(), ConnectionError>;

    fn transmit(&mut self, frame: &CecFrame) -> Result<(), TransmitError>;

    /// Releases the hardware without raising a connection-lost alert.
    fn close(&mut self);

    fn describe(&self) -> String;
}
