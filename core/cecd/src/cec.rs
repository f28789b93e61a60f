//! CEC addressing, opcodes and frames.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

/// CEC frames are at most 16 bytes: header, opcode and 14 operands.
pub const MAX_PARAMS: usize = 14;

pub const KEY_VOLUME_UP: u8 = 0x41;
pub const KEY_VOLUME_DOWN: u8 = 0x42;
pub const KEY_MUTE: u8 = 0x43;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LogicalAddress(u8);

impl LogicalAddress {
    pub const TV: Self = Self(0);
    pub const RECORDING_1: Self = Self(1);
    pub const AUDIO_SYSTEM: Self = Self(5);
    pub const BROADCAST: Self = Self(15);

    pub fn new(value: u8) -> Option<Self> {
        (value <= 0x0f).then_some(Self(value))
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for LogicalAddress {
    type Err = ParseError;

    /// Accepts a single hex nibble (`5`, `f`) or a decimal value up to 15.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        let parsed = if value.len() == 1 {
            u8::from_str_radix(value, 16).ok()
        } else {
            value.parse::<u8>().ok()
        };
        parsed
            .and_then(Self::new)
            .ok_or_else(|| ParseError::LogicalAddress(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalAddress(u16);

impl PhysicalAddress {
    pub fn from_bytes(high: u8, low: u8) -> Self {
        Self(u16::from_be_bytes([high, low]))
    }

    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    fn nibbles(self) -> [u8; 4] {
        [
            (self.0 >> 12) as u8 & 0x0f,
            (self.0 >> 8) as u8 & 0x0f,
            (self.0 >> 4) as u8 & 0x0f,
            self.0 as u8 & 0x0f,
        ]
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.nibbles();
        write!(f, "{a:x}.{b:x}.{c:x}.{d:x}")
    }
}

impl Serialize for PhysicalAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for PhysicalAddress {
    type Err = ParseError;

    /// Accepts `1100` or `1.1.0.0`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let nibbles = split_nibbles(value).ok_or_else(|| ParseError::PhysicalAddress(value.to_string()))?;
        let mut address = 0u16;
        for nibble in nibbles {
            let digit = nibble
                .to_digit(16)
                .ok_or_else(|| ParseError::PhysicalAddress(value.to_string()))?;
            address = (address << 4) | digit as u16;
        }
        Ok(Self(address))
    }
}

/// Physical address with optional `x` wildcards per nibble, e.g. `8xxx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalAddressPattern([Option<u8>; 4]);

impl PhysicalAddressPattern {
    pub fn matches(&self, address: PhysicalAddress) -> bool {
        self.0
            .iter()
            .zip(address.nibbles())
            .all(|(expected, actual)| expected.map_or(true, |nibble| nibble == actual))
    }
}

impl fmt::Display for PhysicalAddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, nibble) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(".")?;
            }
            match nibble {
                Some(value) => write!(f, "{value:x}")?,
                None => f.write_str("x")?,
            }
        }
        Ok(())
    }
}

impl FromStr for PhysicalAddressPattern {
    type Err = ParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::AddressPattern(value.to_string());
        let nibbles = split_nibbles(value).ok_or_else(invalid)?;
        let mut pattern = [None; 4];
        for (slot, nibble) in pattern.iter_mut().zip(nibbles) {
            *slot = match nibble {
                'x' | 'X' | '*' => None,
                other => Some(other.to_digit(16).ok_or_else(invalid)? as u8),
            };
        }
        Ok(Self(pattern))
    }
}

fn split_nibbles(value: &str) -> Option<[char; 4]> {
    let compact: Vec<char> = value.trim().chars().filter(|c| *c != '.').collect();
    let dotted = value.contains('.');
    if dotted && value.trim().split('.').any(|part| part.chars().count() != 1) {
        return None;
    }
    compact.try_into().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Opcode {
    ImageViewOn,
    Standby,
    UserControlPressed,
    UserControlReleased,
    GiveAudioStatus,
    SetSystemAudioMode,
    ReportAudioStatus,
    SystemAudioModeStatus,
    RoutingChange,
    ActiveSource,
    ReportPhysicalAddress,
    RequestActiveSource,
    SetStreamPath,
    InactiveSource,
    Other(u8),
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x04 => Opcode::ImageViewOn,
            0x36 => Opcode::Standby,
            0x44 => Opcode::UserControlPressed,
            0x45 => Opcode::UserControlReleased,
            0x71 => Opcode::GiveAudioStatus,
            0x72 => Opcode::SetSystemAudioMode,
            0x7a => Opcode::ReportAudioStatus,
            0x7e => Opcode::SystemAudioModeStatus,
            0x80 => Opcode::RoutingChange,
            0x82 => Opcode::ActiveSource,
            0x84 => Opcode::ReportPhysicalAddress,
            0x85 => Opcode::RequestActiveSource,
            0x86 => Opcode::SetStreamPath,
            0x9d => Opcode::InactiveSource,
            other => Opcode::Other(other),
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Opcode::ImageViewOn => 0x04,
            Opcode::Standby => 0x36,
            Opcode::UserControlPressed => 0x44,
            Opcode::UserControlReleased => 0x45,
            Opcode::GiveAudioStatus => 0x71,
            Opcode::SetSystemAudioMode => 0x72,
            Opcode::ReportAudioStatus => 0x7a,
            Opcode::SystemAudioModeStatus => 0x7e,
            Opcode::RoutingChange => 0x80,
            Opcode::ActiveSource => 0x82,
            Opcode::ReportPhysicalAddress => 0x84,
            Opcode::RequestActiveSource => 0x85,
            Opcode::SetStreamPath => 0x86,
            Opcode::InactiveSource => 0x9d,
            Opcode::Other(byte) => byte,
        }
    }
}

/// A frame on the wire, in `cec-client`'s `1f:82:11:00` notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CecFrame {
    pub initiator: LogicalAddress,
    pub destination: LogicalAddress,
    pub opcode: Option<Opcode>,
    pub params: Vec<u8>,
}

impl CecFrame {
    pub fn new(
        initiator: LogicalAddress,
        destination: LogicalAddress,
        opcode: Opcode,
        params: Vec<u8>,
    ) -> Self {
        Self {
            initiator,
            destination,
            opcode: Some(opcode),
            params,
        }
    }

    pub fn user_control_pressed(
        initiator: LogicalAddress,
        destination: LogicalAddress,
        key: u8,
    ) -> Self {
        Self::new(initiator, destination, Opcode::UserControlPressed, vec![key])
    }

    pub fn user_control_released(initiator: LogicalAddress, destination: LogicalAddress) -> Self {
        Self::new(initiator, destination, Opcode::UserControlReleased, Vec::new())
    }
}

impl fmt::Display for CecFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.initiator, self.destination)?;
        if let Some(opcode) = self.opcode {
            write!(f, ":{:02x}", opcode.byte())?;
        }
        for param in &self.params {
            write!(f, ":{param:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for CecFrame {
    type Err = ParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }

        let mut tokens = text.split(':');
        let header = tokens.next().unwrap_or_default();
        let header_byte = parse_byte(header).ok_or_else(|| ParseError::BadHeader(header.to_string()))?;
        let initiator = LogicalAddress(header_byte >> 4);
        let destination = LogicalAddress(header_byte & 0x0f);

        let mut bytes = Vec::new();
        for (index, token) in tokens.enumerate() {
            let byte = parse_byte(token).ok_or_else(|| ParseError::BadByte {
                index: index + 1,
                token: token.to_string(),
            })?;
            bytes.push(byte);
        }

        let mut bytes = bytes.into_iter();
        let opcode = bytes.next().map(Opcode::from_byte);
        let params: Vec<u8> = bytes.collect();
        if params.len() > MAX_PARAMS {
            return Err(ParseError::TooManyParams(params.len()));
        }

        Ok(Self {
            initiator,
            destination,
            opcode,
            params,
        })
    }
}

fn parse_byte(token: &str) -> Option<u8> {
    if token.len() != 2 || !token.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u8::from_str_radix(token, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_text_round_trip() {
        let frame: CecFrame = "1f:82:11:00".parse().unwrap();
        assert_eq!(frame.initiator, LogicalAddress::RECORDING_1);
        assert_eq!(frame.destination, LogicalAddress::BROADCAST);
        assert_eq!(frame.opcode, Some(Opcode::ActiveSource));
        assert_eq!(frame.params, vec![0x11, 0x00]);
        assert_eq!(frame.to_string(), "1f:82:11:00");
    }

    #[test]
    fn poll_frames_have_no_opcode() {
        let frame: CecFrame = "10".parse().unwrap();
        assert_eq!(frame.opcode, None);
        assert_eq!(frame.to_string(), "10");
    }

    #[test]
    fn rejects_bad_tokens() {
        assert_eq!("".parse::<CecFrame>(), Err(ParseError::Empty));
        assert!(matches!("1:82".parse::<CecFrame>(), Err(ParseError::BadHeader(_))));
        assert!(matches!(
            "1f:8g".parse::<CecFrame>(),
            Err(ParseError::BadByte { index: 1, .. })
        ));
        assert!(matches!("1f:82:".parse::<CecFrame>(), Err(ParseError::BadByte { .. })));
        let long = format!("1f:82{}", ":00".repeat(15));
        assert_eq!(long.parse::<CecFrame>(), Err(ParseError::TooManyParams(15)));
    }

    #[test]
    fn logical_address_forms() {
        assert_eq!("5".parse::<LogicalAddress>().unwrap(), LogicalAddress::AUDIO_SYSTEM);
        assert_eq!("f".parse::<LogicalAddress>().unwrap(), LogicalAddress::BROADCAST);
        assert_eq!("15".parse::<LogicalAddress>().unwrap(), LogicalAddress::BROADCAST);
        assert!("16".parse::<LogicalAddress>().is_err());
    }

    #[test]
    fn physical_address_forms() {
        let compact: PhysicalAddress = "1100".parse().unwrap();
        let dotted: PhysicalAddress = "1.1.0.0".parse().unwrap();
        assert_eq!(compact, dotted);
        assert_eq!(compact, PhysicalAddress::from_bytes(0x11, 0x00));
        assert_eq!(compact.to_string(), "1.1.0.0");
        assert_eq!(compact.to_bytes(), [0x11, 0x00]);
        assert!("11.00".parse::<PhysicalAddress>().is_err());
        assert!("110".parse::<PhysicalAddress>().is_err());
    }

    #[test]
    fn pattern_wildcards() {
        let pattern: PhysicalAddressPattern = "8xxx".parse().unwrap();
        assert!(pattern.matches(PhysicalAddress::from_bytes(0x80, 0x00)));
        assert!(pattern.matches(PhysicalAddress::from_bytes(0x84, 0x21)));
        assert!(!pattern.matches(PhysicalAddress::from_bytes(0x11, 0x00)));

        let exact: PhysicalAddressPattern = "8.0.0.0".parse().unwrap();
        assert!(!exact.matches(PhysicalAddress::from_bytes(0x81, 0x00)));
        assert_eq!(exact.to_string(), "8.0.0.0");
        assert!("8xx".parse::<PhysicalAddressPattern>().is_err());
    }

    #[test]
    fn opcode_bytes_round_trip() {
        for byte in [0x04, 0x36, 0x72, 0x7a, 0x7e, 0x80, 0x82, 0x84, 0x85, 0x86, 0x9d, 0x9f] {
            assert_eq!(Opcode::from_byte(byte).byte(), byte);
        }
        assert_eq!(Opcode::from_byte(0x9f), Opcode::Other(0x9f));
    }
}
