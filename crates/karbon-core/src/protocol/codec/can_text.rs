//! The MCU's native ASCII CAN format.
//!
//! Received frames: `<ID hex> <DATA hex>\r` (e.g. `123 11223344`, `00000999 DEADBEEF`).
//! Transmitted frames: `<std|ext> <id hex> <len> <data hex> <data|remote>\r`.

use tracing::warn;

use super::{take_lines, Decoder, Encoder, MAX_LINE_LENGTH};
use crate::event::{CanFrame, Event, Outgoing};
use crate::protocol::KarbonError;

/// Data placeholder the MCU expects when a frame carries no bytes
const EMPTY_DATA: &str = "FF";

/// ASCII CAN codec
#[derive(Debug, Default)]
pub struct KarbonCanCodec {
    buffer: Vec<u8>,
}

impl KarbonCanCodec {
    /// Codec with an empty line buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse one received line
    pub fn parse_line(line: &str) -> Result<CanFrame, KarbonError> {
        let mut fields = line.split_whitespace();
        let id_field = fields
            .next()
            .ok_or_else(|| KarbonError::MalformedFrame("empty line".into()))?;
        let data_field = fields.next().unwrap_or("");
        if fields.next().is_some() {
            return Err(KarbonError::MalformedFrame(format!("unexpected fields in '{}'", line)));
        }

        if id_field.len() > 8 {
            return Err(KarbonError::MalformedFrame(format!("id too long: '{}'", id_field)));
        }
        let id = u32::from_str_radix(id_field, 16)
            .map_err(|_| KarbonError::MalformedFrame(format!("invalid hex id: '{}'", id_field)))?;

        let payload = parse_hex(data_field)
            .ok_or_else(|| KarbonError::MalformedFrame(format!("invalid data: '{}'", data_field)))?;

        CanFrame::new(id, payload).map_err(|e| KarbonError::MalformedFrame(e.to_string()))
    }

    fn format_frame(id: u32, len: usize, data: &str, kind: &str) -> Vec<u8> {
        let format = if id > crate::protocol::MAX_STANDARD_ID {
            "ext"
        } else {
            "std"
        };
        format!("{} {:x} {} {} {}\r", format, id, len, data, kind).into_bytes()
    }
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

impl Decoder for KarbonCanCodec {
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Event, KarbonError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();

        for line in take_lines(&mut self.buffer) {
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            out.push(Self::parse_line(text).map(Event::CanFrame));
        }

        if self.buffer.len() > MAX_LINE_LENGTH {
            warn!("Discarding {} unterminated CAN bytes", self.buffer.len());
            self.buffer.clear();
            out.push(Err(KarbonError::MalformedFrame("unterminated line".into())));
        }
        out
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Encoder for KarbonCanCodec {
    fn encode(&self, message: &Outgoing) -> Result<Vec<u8>, KarbonError> {
        match message {
            Outgoing::Frame(frame) => {
                if frame.payload.is_empty() {
                    return Ok(Self::format_frame(frame.id, 0, EMPTY_DATA, "data"));
                }
                let data: String = frame.payload.iter().map(|b| format!("{:02x}", b)).collect();
                Ok(Self::format_frame(frame.id, frame.payload.len(), &data, "data"))
            }
            Outgoing::Remote { id, len } => {
                if *len as usize > crate::protocol::MAX_CAN_PAYLOAD {
                    return Err(KarbonError::InvalidFrame(format!("remote length {} exceeds 8", len)));
                }
                Ok(Self::format_frame(*id, *len as usize, EMPTY_DATA, "remote"))
            }
            Outgoing::Line(line) => Ok(format!("{}\r", line).into_bytes()),
            Outgoing::Bytes(bytes) => Ok(bytes.clone()),
            Outgoing::Command(_) => Err(KarbonError::Unsupported("terminal command")),
        }
    }
}
