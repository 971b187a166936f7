//! Events decoded from the MCU channels and messages written back to them.

use serde::{Deserialize, Serialize};

use crate::protocol::commands::TerminalCommand;
use crate::protocol::{KarbonError, MAX_CAN_PAYLOAD, MAX_STANDARD_ID};

/// A classic CAN data frame
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    /// Frame identifier (11-bit standard or 29-bit extended)
    pub id: u32,
    /// Data bytes, at most 8
    pub payload: Vec<u8>,
}

impl CanFrame {
    /// Create a frame, rejecting payloads longer than 8 bytes or ids wider than 29 bits
    pub fn new(id: u32, payload: impl Into<Vec<u8>>) -> Result<Self, KarbonError> {
        let payload = payload.into();
        if payload.len() > MAX_CAN_PAYLOAD {
            return Err(KarbonError::InvalidFrame(format!(
                "payload of {} bytes exceeds {}",
                payload.len(),
                MAX_CAN_PAYLOAD
            )));
        }
        if id > 0x1FFF_FFFF {
            return Err(KarbonError::InvalidFrame(format!("id {:#x} exceeds 29 bits", id)));
        }
        Ok(Self { id, payload })
    }

    /// Frames above the 11-bit range go out in CAN 2.0B format
    pub fn is_extended(&self) -> bool {
        self.id > MAX_STANDARD_ID
    }

    /// Payload as a big-endian integer, the way the terminal prints it
    pub fn payload_value(&self) -> Option<u64> {
        if self.payload.is_empty() {
            return None;
        }
        Some(
            self.payload
                .iter()
                .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)),
        )
    }
}

/// Snapshot of the four digital inputs and four digital outputs.
///
/// Bit `n` of each field is pin `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DioState {
    /// Input pins, bit `n` = pin `n`
    pub inputs: u8,
    /// Output pins, bit `n` = pin `n`
    pub outputs: u8,
}

impl DioState {
    /// State from raw input and output bits
    pub fn new(inputs: u8, outputs: u8) -> Self {
        Self {
            inputs: inputs & 0x0F,
            outputs: outputs & 0x0F,
        }
    }

    /// Parse the terminal's `iiii oooo` report (the space is optional)
    pub fn parse(text: &str) -> Option<Self> {
        let digits: Vec<u8> = text.bytes().filter(|b| *b != b' ').collect();
        if digits.len() != 8 || digits.iter().any(|b| *b != b'0' && *b != b'1') {
            return None;
        }
        let bits = |chunk: &[u8]| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (pin, b)| acc | (((*b == b'1') as u8) << pin))
        };
        Some(Self::new(bits(&digits[0..4]), bits(&digits[4..8])))
    }

    /// Level of input `pin`
    pub fn input(&self, pin: u8) -> bool {
        pin < 4 && self.inputs & (1 << pin) != 0
    }

    /// Level of output `pin`
    pub fn output(&self, pin: u8) -> bool {
        pin < 4 && self.outputs & (1 << pin) != 0
    }

    /// Inputs in the low nibble, outputs in the high nibble
    pub fn bus(&self) -> u8 {
        self.inputs | (self.outputs << 4)
    }
}

impl std::fmt::Display for DioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for pin in 0..4 {
            f.write_str(if self.input(pin) { "1" } else { "0" })?;
        }
        f.write_str(" ")?;
        for pin in 0..4 {
            f.write_str(if self.output(pin) { "1" } else { "0" })?;
        }
        Ok(())
    }
}

/// A decoded unit of traffic from either channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Frame received on the CAN channel
    CanFrame(CanFrame),
    /// Terminal output that matched no other pattern
    TerminalLine {
        /// Line with control characters stripped
        text: String,
    },
    /// Configuration value reported by the terminal
    ConfigEntry {
        /// Canonical key, e.g. `can-baudrate`
        key: String,
        /// Reported value
        value: String,
    },
    /// Digital IO state report
    Dio(DioState),
}

impl Event {
    /// The frame, if this is a CAN event
    pub fn as_can_frame(&self) -> Option<&CanFrame> {
        match self {
            Event::CanFrame(frame) => Some(frame),
            _ => None,
        }
    }

    /// The state, if this is a DIO report
    pub fn as_dio(&self) -> Option<DioState> {
        match self {
            Event::Dio(state) => Some(*state),
            _ => None,
        }
    }
}

/// Something a session can write to its port
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// CAN data frame
    Frame(CanFrame),
    /// CAN remote request for `len` bytes
    Remote {
        /// Identifier to request
        id: u32,
        /// Requested data length, 0-8
        len: u8,
    },
    /// Terminal command
    Command(TerminalCommand),
    /// Verbatim terminal line, terminator appended by the codec
    Line(String),
    /// Bytes written without encoding
    Bytes(Vec<u8>),
}

impl From<CanFrame> for Outgoing {
    fn from(frame: CanFrame) -> Self {
        Outgoing::Frame(frame)
    }
}

impl From<TerminalCommand> for Outgoing {
    fn from(command: TerminalCommand) -> Self {
        Outgoing::Command(command)
    }
}

impl From<&str> for Outgoing {
    fn from(line: &str) -> Self {
        Outgoing::Line(line.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_limits() {
        assert!(CanFrame::new(0x123, vec![0; 8]).is_ok());
        assert!(CanFrame::new(0x123, vec![0; 9]).is_err());
        assert!(CanFrame::new(0x2000_0000, vec![]).is_err());
    }

    #[test]
    fn test_extended_threshold() {
        assert!(!CanFrame::new(0x7FF, vec![]).unwrap().is_extended());
        assert!(CanFrame::new(0x800, vec![]).unwrap().is_extended());
    }

    #[test]
    fn test_payload_value() {
        let frame = CanFrame::new(0x777, vec![0x11, 0x22, 0x33, 0x44]).unwrap();
        assert_eq!(frame.payload_value(), Some(0x11223344));
        assert_eq!(CanFrame::new(0x777, vec![]).unwrap().payload_value(), None);
    }

    #[test]
    fn test_dio_parse_and_display() {
        let state = DioState::parse("1000 0011").unwrap();
        assert!(state.input(0));
        assert!(!state.input(1));
        assert!(state.output(2));
        assert!(state.output(3));
        assert_eq!(state.to_string(), "1000 0011");

        assert_eq!(DioState::parse("10000011"), Some(state));
        assert_eq!(DioState::parse("1000 001"), None);
        assert_eq!(DioState::parse("1000 0012"), None);
    }
}
