//! Wire codecs
//!
//! Each channel turns a raw byte stream into [`Event`]s with a [`Decoder`] and turns
//! [`Outgoing`] messages into bytes with an [`Encoder`]. The CAN frame layout is vendor
//! specific, so sessions take the codec pair as a replaceable boundary.
//!
//! - [`KarbonCanCodec`]: the MCU's ASCII CAN format (default)
//! - [`BinaryCanCodec`]: marker/length/CRC32 framed CAN format
//! - [`TerminalCodec`]: line-oriented terminal output

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::KarbonError;
use crate::event::{Event, Outgoing};

mod can_binary;
mod can_text;
mod terminal;

pub use can_binary::{BinaryCanCodec, START_MARKER};
pub use can_text::KarbonCanCodec;
pub use terminal::TerminalCodec;

/// Longest run of bytes kept while waiting for a line terminator
pub const MAX_LINE_LENGTH: usize = 512;

/// Stateful byte-stream parser.
///
/// `decode` consumes a chunk and returns every item completed by it, in wire order.
/// Malformed input is reported as [`KarbonError::MalformedFrame`] and skipped; partial
/// input is buffered until the next call.
pub trait Decoder: Send {
    /// Feed `bytes` and collect everything they complete
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Event, KarbonError>>;

    /// Forget any buffered partial input
    fn reset(&mut self);
}

/// Stateless message encoder shared between the caller and the reader thread
pub trait Encoder: Send + Sync {
    /// Wire bytes for `message`, or `Unsupported` if this channel cannot carry it
    fn encode(&self, message: &Outgoing) -> Result<Vec<u8>, KarbonError>;
}

/// Built-in codec selection for [`crate::session::SessionConfig`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    /// Pick the MCU's native format for the channel
    #[default]
    Auto,
    /// MCU's ASCII CAN lines
    KarbonCan,
    /// Marker, length and CRC32 framed CAN
    BinaryCan,
    /// Terminal text lines
    Terminal,
}

impl CodecKind {
    /// Build a fresh decoder/encoder pair
    pub fn build(self, channel: super::ChannelKind) -> (Box<dyn Decoder>, Arc<dyn Encoder>) {
        match self.resolve(channel) {
            CodecKind::BinaryCan => (Box::new(BinaryCanCodec::new()), Arc::new(BinaryCanCodec::new())),
            CodecKind::Terminal => (Box::new(TerminalCodec::new()), Arc::new(TerminalCodec::new())),
            _ => (Box::new(KarbonCanCodec::new()), Arc::new(KarbonCanCodec::new())),
        }
    }

    fn resolve(self, channel: super::ChannelKind) -> CodecKind {
        match (self, channel) {
            (CodecKind::Auto, super::ChannelKind::Can) => CodecKind::KarbonCan,
            (CodecKind::Auto, super::ChannelKind::Terminal) => CodecKind::Terminal,
            (kind, _) => kind,
        }
    }
}

/// Split `buffer` into complete lines on `\r`/`\n`, leaving the unterminated tail in place.
pub(crate) fn take_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\r' || *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChannelKind;

    #[test]
    fn test_take_lines_keeps_tail() {
        let mut buffer = b"one\r\ntwo\rthr".to_vec();
        let lines = take_lines(&mut buffer);
        assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(buffer, b"thr".to_vec());
    }

    #[test]
    fn test_auto_codec_follows_channel() {
        let (mut decoder, _) = CodecKind::Auto.build(ChannelKind::Terminal);
        let events = decoder.decode(b"1111 0000\r");
        assert!(matches!(events[0], Ok(Event::Dio(_))));

        let (mut decoder, _) = CodecKind::Auto.build(ChannelKind::Can);
        let events = decoder.decode(b"123 11223344\r");
        assert!(matches!(events[0], Ok(Event::CanFrame(_))));
    }
}
