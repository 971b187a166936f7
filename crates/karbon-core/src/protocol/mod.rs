//! Serial Protocol Communication
//!
//! Port discovery, port claiming, transport channels, wire codecs and terminal commands for
//! the Karbon MCU's two virtual serial ports.

use serde::{Deserialize, Serialize};

pub mod claim;
pub mod codec;
pub mod commands;
mod error;
pub mod mock;
pub mod serial;
pub mod stream;

pub use claim::PortClaim;
pub use codec::{BinaryCanCodec, CodecKind, Decoder, Encoder, KarbonCanCodec, TerminalCodec};
pub use commands::TerminalCommand;
pub use error::KarbonError;
pub use mock::MockChannel;
pub use serial::{list_ports, locate, locate_with, open_port, LocatorConfig, PortInfo, PortPair, PortRef};
pub use stream::{CommunicationChannel, SerialChannel};

/// USB vendor id of the Karbon MCU
pub const KARBON_VID: u16 = 0x1FC9;

/// USB product id of the Karbon MCU
pub const KARBON_PID: u16 = 0x00A3;

/// Host-side rate of both virtual serial ports
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Read timeout of the reader thread; bounds how long `close` waits for it to notice
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10;

/// Default bound on queued events per session
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Default wait for the reader thread to exit on close
pub const DEFAULT_CLOSE_TIMEOUT_MS: u64 = 1000;

/// Largest classic CAN payload
pub const MAX_CAN_PAYLOAD: usize = 8;

/// Largest 11-bit identifier; anything above goes out as an extended frame
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Which of the MCU's two ports a session talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// CAN traffic port
    Can,
    /// Text command port
    Terminal,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelKind::Can => f.write_str("can"),
            ChannelKind::Terminal => f.write_str("terminal"),
        }
    }
}
