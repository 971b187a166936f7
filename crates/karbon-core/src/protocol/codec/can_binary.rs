//! Binary CAN framing
//!
//! Frame format:
//! - 1 byte: start marker (0xAA)
//! - 4 bytes: CAN id (big-endian)
//! - 1 byte: payload length (0..=8)
//! - N bytes: payload
//! - 4 bytes: CRC32 of id + length + payload (big-endian)

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use tracing::debug;

use super::{Decoder, Encoder};
use crate::event::{CanFrame, Event, Outgoing};
use crate::protocol::{KarbonError, MAX_CAN_PAYLOAD};

/// First byte of every frame
pub const START_MARKER: u8 = 0xAA;

const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 4;

/// Framed binary CAN codec
#[derive(Debug, Default)]
pub struct BinaryCanCodec {
    buffer: Vec<u8>,
}

impl BinaryCanCodec {
    /// Decoder with an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a frame to raw bytes
    pub fn frame_to_bytes(frame: &CanFrame) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_LEN + frame.payload.len() + CRC_LEN);
        bytes.push(START_MARKER);

        let mut id_bytes = [0u8; 4];
        BigEndian::write_u32(&mut id_bytes, frame.id);
        bytes.extend_from_slice(&id_bytes);
        bytes.push(frame.payload.len() as u8);
        bytes.extend_from_slice(&frame.payload);

        let mut crc_bytes = [0u8; 4];
        BigEndian::write_u32(&mut crc_bytes, calculate_crc(&bytes[1..]));
        bytes.extend_from_slice(&crc_bytes);
        bytes
    }

    /// Try to take one frame off the front of the buffer.
    ///
    /// `None` means more bytes are needed. Garbage before a start marker and frames that
    /// fail validation are dropped up to the next plausible marker.
    fn next_frame(&mut self) -> Option<Result<CanFrame, KarbonError>> {
        match self.buffer.iter().position(|b| *b == START_MARKER) {
            Some(0) => {}
            Some(pos) => {
                self.buffer.drain(..pos);
                return Some(Err(KarbonError::MalformedFrame(format!(
                    "skipped {} bytes before start marker",
                    pos
                ))));
            }
            None => {
                let skipped = self.buffer.len();
                self.buffer.clear();
                return (skipped > 0).then(|| {
                    Err(KarbonError::MalformedFrame(format!(
                        "skipped {} bytes without start marker",
                        skipped
                    )))
                });
            }
        }

        if self.buffer.len() < HEADER_LEN {
            return None;
        }

        let len = self.buffer[5] as usize;
        if len > MAX_CAN_PAYLOAD {
            self.buffer.remove(0);
            return Some(Err(KarbonError::MalformedFrame(format!("length {} exceeds 8", len))));
        }

        let total = HEADER_LEN + len + CRC_LEN;
        if self.buffer.len() < total {
            // A complete frame further on means this one was cut short
            let next = (1..self.buffer.len())
                .find(|&pos| valid_frame_len(&self.buffer[pos..]).is_some())?;
            self.buffer.drain(..next);
            return Some(Err(KarbonError::MalformedFrame(format!(
                "truncated frame, {} of {} bytes",
                next, total
            ))));
        }

        let expected = calculate_crc(&self.buffer[1..HEADER_LEN + len]);
        let received = BigEndian::read_u32(&self.buffer[HEADER_LEN + len..total]);
        if expected != received {
            self.buffer.remove(0);
            return Some(Err(KarbonError::MalformedFrame(format!(
                "CRC mismatch: expected {:#010x}, got {:#010x}",
                expected, received
            ))));
        }

        let id = BigEndian::read_u32(&self.buffer[1..5]);
        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..total);
        Some(CanFrame::new(id, payload).map_err(|e| KarbonError::MalformedFrame(e.to_string())))
    }
}

/// Length of the frame at the start of `bytes`, if a complete one with a good CRC is there
fn valid_frame_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_LEN || bytes[0] != START_MARKER {
        return None;
    }
    let len = bytes[5] as usize;
    let total = HEADER_LEN + len + CRC_LEN;
    if len > MAX_CAN_PAYLOAD || bytes.len() < total {
        return None;
    }
    let received = BigEndian::read_u32(&bytes[HEADER_LEN + len..total]);
    (calculate_crc(&bytes[1..HEADER_LEN + len]) == received).then_some(total)
}

fn calculate_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

impl Decoder for BinaryCanCodec {
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Event, KarbonError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(result) = self.next_frame() {
            if let Err(e) = &result {
                debug!("Binary CAN resync: {}", e);
            }
            out.push(result.map(Event::CanFrame));
        }
        out
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }
}

impl Encoder for BinaryCanCodec {
    fn encode(&self, message: &Outgoing) -> Result<Vec<u8>, KarbonError> {
        match message {
            Outgoing::Frame(frame) => Ok(Self::frame_to_bytes(frame)),
            Outgoing::Bytes(bytes) => Ok(bytes.clone()),
            Outgoing::Remote { .. } => Err(KarbonError::Unsupported("remote request")),
            Outgoing::Command(_) | Outgoing::Line(_) => {
                Err(KarbonError::Unsupported("terminal command"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(results: Vec<Result<Event, KarbonError>>) -> Vec<CanFrame> {
        results
            .into_iter()
            .filter_map(|r| r.ok())
            .filter_map(|e| e.as_can_frame().cloned())
            .collect()
    }

    #[test]
    fn test_frame_roundtrip() {
        let codec = BinaryCanCodec::new();
        for (id, payload) in [
            (0x000, vec![]),
            (0x123, vec![0x11, 0x22, 0x33, 0x44]),
            (0x1FFF_FFFF, vec![0xFF; 8]),
        ] {
            let frame = CanFrame::new(id, payload).unwrap();
            let bytes = codec.encode(&Outgoing::Frame(frame.clone())).unwrap();
            let mut decoder = BinaryCanCodec::new();
            assert_eq!(frames(decoder.decode(&bytes)), vec![frame]);
        }
    }

    #[test]
    fn test_crc_verification() {
        let frame = CanFrame::new(0x42, vec![1, 2, 3, 4, 5]).unwrap();
        let mut encoded = BinaryCanCodec::frame_to_bytes(&frame);

        // Corrupt a payload byte
        encoded[7] ^= 0x0F;

        let mut decoder = BinaryCanCodec::new();
        let results = decoder.decode(&encoded);
        assert!(frames(results).is_empty());
    }

    #[test]
    fn test_resync_after_bad_frame() {
        let good: Vec<CanFrame> = (0..3)
            .map(|i| CanFrame::new(0x100 + i, vec![i as u8, 0x10, 0x20]).unwrap())
            .collect();

        let mut bad = BinaryCanCodec::frame_to_bytes(&CanFrame::new(0x55, vec![1, 2]).unwrap());
        let last = bad.len() - 1;
        bad[last] ^= 0x01;

        let mut stream = vec![0x00, 0x13];
        stream.extend_from_slice(&bad);
        for frame in &good {
            stream.extend_from_slice(&BinaryCanCodec::frame_to_bytes(frame));
        }

        let mut decoder = BinaryCanCodec::new();
        assert_eq!(frames(decoder.decode(&stream)), good);
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let frame = CanFrame::new(0x321, vec![9, 8, 7]).unwrap();
        let bytes = BinaryCanCodec::frame_to_bytes(&frame);

        let mut decoder = BinaryCanCodec::new();
        assert!(decoder.decode(&bytes[..4]).is_empty());
        assert!(decoder.decode(&bytes[4..9]).is_empty());
        assert_eq!(frames(decoder.decode(&bytes[9..])), vec![frame]);
    }

    #[test]
    fn test_truncated_frame_does_not_hold_back_next() {
        let mut stream = vec![START_MARKER, 0, 0, 0x01, 0x23, 8];
        let frame = CanFrame::new(0x7, vec![]).unwrap();
        stream.extend_from_slice(&BinaryCanCodec::frame_to_bytes(&frame));

        let mut decoder = BinaryCanCodec::new();
        let results = decoder.decode(&stream);
        assert!(matches!(results[0], Err(KarbonError::MalformedFrame(_))));
        assert_eq!(frames(results), vec![frame]);
    }

    #[test]
    fn test_truncated_frame_then_several_valid() {
        let good: Vec<CanFrame> = (0..3)
            .map(|i| CanFrame::new(0x20 + i, vec![]).unwrap())
            .collect();
        let mut stream = vec![START_MARKER, 0, 0, 0, 0x10, 8, 0x01];
        for frame in &good {
            stream.extend_from_slice(&BinaryCanCodec::frame_to_bytes(frame));
        }

        let mut decoder = BinaryCanCodec::new();
        assert_eq!(frames(decoder.decode(&stream)), good);
    }

    #[test]
    fn test_oversize_length_is_skipped() {
        let mut stream = vec![START_MARKER, 0, 0, 1, 0x23, 12];
        let frame = CanFrame::new(0x7, vec![0x01]).unwrap();
        stream.extend_from_slice(&BinaryCanCodec::frame_to_bytes(&frame));

        let mut decoder = BinaryCanCodec::new();
        assert_eq!(frames(decoder.decode(&stream)), vec![frame]);
    }
}
