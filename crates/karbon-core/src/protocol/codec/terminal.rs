//! Terminal line codec
//!
//! The terminal answers commands with `\r`-terminated ASCII lines:
//! - `1111 0000`: digital inputs then digital outputs
//! - `<1.2.3.4 | Jan 01 2020>`: firmware version banner
//! - `Ignition Sense: on` or `key=value`: configuration values
//! - anything else is passed through as a plain line

use regex::Regex;
use tracing::warn;

use super::{take_lines, Decoder, Encoder, MAX_LINE_LENGTH};
use crate::event::{DioState, Event, Outgoing};
use crate::protocol::KarbonError;

/// Line-oriented terminal codec
#[derive(Debug)]
pub struct TerminalCodec {
    buffer: Vec<u8>,
    dio_re: Regex,
    banner_re: Regex,
    entry_re: Regex,
}

impl Default for TerminalCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalCodec {
    /// Codec with an empty line buffer
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dio_re: Regex::new(r"^([01]{4}) ?([01]{4})$").expect("valid DIO pattern"),
            banner_re: Regex::new(r"^<\s*([^|>]*?)\s*(?:\|\s*([^>]*?)\s*)?>$")
                .expect("valid banner pattern"),
            entry_re: Regex::new(r"^([A-Za-z][A-Za-z0-9 _.\-]*?)\s*[=:]\s*(\S.*)$")
                .expect("valid entry pattern"),
        }
    }

    /// Classify one cleaned line. A non-empty line always produces at least one event.
    pub fn classify(&self, line: &str) -> Vec<Event> {
        if let Some(caps) = self.dio_re.captures(line) {
            if let Some(state) = DioState::parse(&format!("{}{}", &caps[1], &caps[2])) {
                return vec![Event::Dio(state)];
            }
        }

        if line.to_ascii_lowercase().contains("err") {
            warn!("Terminal reported: {}", line);
            return vec![Event::TerminalLine {
                text: line.to_string(),
            }];
        }

        if let Some(caps) = self.banner_re.captures(line) {
            let mut events = vec![Event::ConfigEntry {
                key: "version".to_string(),
                value: caps[1].to_string(),
            }];
            if let Some(build) = caps.get(2).filter(|m| !m.as_str().is_empty()) {
                events.push(Event::ConfigEntry {
                    key: "build".to_string(),
                    value: build.as_str().to_string(),
                });
            }
            return events;
        }

        if let Some(caps) = self.entry_re.captures(line) {
            return vec![Event::ConfigEntry {
                key: canonical_key(&caps[1]),
                value: caps[2].trim().to_string(),
            }];
        }

        vec![Event::TerminalLine {
            text: line.to_string(),
        }]
    }
}

/// Lower kebab-case, with the two labels the firmware prints differently from the
/// parameter names `set` accepts.
pub fn canonical_key(label: &str) -> String {
    let key = label
        .trim()
        .to_ascii_lowercase()
        .split(|c: char| c == ' ' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");

    if key.starts_with("boot") {
        "boot-config".to_string()
    } else if key.starts_with("remote") {
        "dio-power-switch".to_string()
    } else {
        key
    }
}

fn clean(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

impl Decoder for TerminalCodec {
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Event, KarbonError>> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = take_lines(&mut self.buffer);
        if self.buffer.len() > MAX_LINE_LENGTH {
            lines.push(std::mem::take(&mut self.buffer));
        }

        lines
            .iter()
            .map(|line| clean(line))
            .filter(|line| !line.is_empty())
            .flat_map(|line| self.classify(&line))
            .map(Ok)
            .collect()
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Encoder for TerminalCodec {
    fn encode(&self, message: &Outgoing) -> Result<Vec<u8>, KarbonError> {
        match message {
            Outgoing::Command(command) => Ok(format!("{}\r", command.to_line()).into_bytes()),
            Outgoing::Line(line) => Ok(format!("{}\r", line).into_bytes()),
            Outgoing::Bytes(bytes) => Ok(bytes.clone()),
            Outgoing::Frame(_) | Outgoing::Remote { .. } => Err(KarbonError::Unsupported("CAN frame")),
        }
    }
}
