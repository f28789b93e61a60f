//! Traffic event model: raw bus trace lines into structured events.
//!
//! Trace lines use the `<src><dst>:<opcode>[:<param>]*` hex notation printed
//! by the bus driver, optionally prefixed with a `>>` (received) or `<<`
//! (transmitted) marker. Anything that does not frame cleanly is dropped with
//! a warning; poll frames (header only) carry no event and are dropped quietly.

use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::cec::{CecFrame, LogicalAddress, Opcode, PhysicalAddress};
use crate::error::ParseError;

/// Volume byte value meaning "unknown".
const VOLUME_UNKNOWN: u8 = 0x7f;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrafficEvent {
    pub source: LogicalAddress,
    pub destination: LogicalAddress,
    pub opcode: Opcode,
    pub params: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct AudioStatus {
    pub volume: Option<u8>,
    pub muted: bool,
}

pub fn parse(raw: &str) -> Option<TrafficEvent> {
    match try_parse(raw) {
        Ok(event) => Some(event),
        Err(ParseError::MissingOpcode) => {
            debug!(line = raw, "Ignoring poll frame");
            None
        }
        Err(err) => {
            warn!(line = raw, error = %err, "Dropping malformed trace line");
            None
        }
    }
}

pub fn try_parse(raw: &str) -> Result<TrafficEvent, ParseError> {
    let body = strip_direction(raw.trim());
    let frame: CecFrame = body.parse()?;
    let opcode = frame.opcode.ok_or(ParseError::MissingOpcode)?;
    Ok(TrafficEvent {
        source: frame.initiator,
        destination: frame.destination,
        opcode,
        params: frame.params,
    })
}

fn strip_direction(line: &str) -> &str {
    line.strip_prefix(">>")
        .or_else(|| line.strip_prefix("<<"))
        .map(str::trim_start)
        .unwrap_or(line)
}

impl TrafficEvent {
    /// Physical address carried by routing-related opcodes. For a routing
    /// change this is the new address.
    pub fn physical_address(&self) -> Option<PhysicalAddress> {
        let offset = match self.opcode {
            Opcode::ActiveSource | Opcode::ReportPhysicalAddress | Opcode::SetStreamPath => 0,
            Opcode::RoutingChange => 2,
            _ => return None,
        };
        match self.params.get(offset..offset + 2) {
            Some([high, low]) => Some(PhysicalAddress::from_bytes(*high, *low)),
            _ => None,
        }
    }

    pub fn audio_status(&self) -> Option<AudioStatus> {
        if self.opcode != Opcode::ReportAudioStatus {
            return None;
        }
        let byte = *self.params.first()?;
        let volume = byte & 0x7f;
        Some(AudioStatus {
            volume: (volume != VOLUME_UNKNOWN).then_some(volume.min(100)),
            muted: byte & 0x80 != 0,
        })
    }

    /// `Some(true)` when the event announces system audio mode (ARC) on.
    pub fn system_audio_mode(&self) -> Option<bool> {
        match self.opcode {
            Opcode::SetSystemAudioMode | Opcode::SystemAudioModeStatus => {
                match self.params.first()? {
                    0x00 => Some(false),
                    0x01 => Some(true),
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

impl fmt::Display for TrafficEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = CecFrame::new(self.source, self.destination, self.opcode, self.params.clone());
        fmt::Display::fmt(&frame, f)
    }
}
