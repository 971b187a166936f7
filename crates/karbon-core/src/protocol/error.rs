//! Driver errors

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the Karbon MCU
#[derive(Error, Debug)]
pub enum KarbonError {
    /// No port with that name, or no MCU on the bus
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Another session or process holds the port
    #[error("Port busy: {0}")]
    PortBusy(String),

    /// The serial driver rejected the port settings
    #[error("Serial port error: {0}")]
    SerialError(String),

    /// Reading or writing the channel failed
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Nothing arrived before the deadline
    #[error("Timed out")]
    Timeout,

    /// Non-blocking receive found the queue empty
    #[error("No event available")]
    WouldBlock,

    /// The session is closed or faulted
    #[error("Session is not open")]
    NotOpen,

    /// Received bytes that do not decode
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A reaction callback returned an error or panicked
    #[error("Reaction {id} failed: {message}")]
    ReactionCallbackError {
        /// Raw id of the failing reaction
        id: u64,
        /// What went wrong
        message: String,
    },

    /// The reader thread outlived the close timeout; the port stays claimed
    #[error("Reader thread did not stop within {0:?}")]
    ReaderStuck(Duration),

    /// An outgoing frame breaks CAN limits
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// The message does not exist on this kind of channel
    #[error("{0} cannot be sent on this channel")]
    Unsupported(&'static str),

    /// A configuration file could not be read or parsed
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KarbonError {
    /// Whether the caller can simply retry the operation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            KarbonError::Timeout | KarbonError::WouldBlock | KarbonError::MalformedFrame(_)
        )
    }
}

impl From<serialport::Error> for KarbonError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => KarbonError::PortNotFound(e.to_string()),
            serialport::ErrorKind::Io(kind) => {
                if is_busy(kind, &e.description) {
                    KarbonError::PortBusy(e.description)
                } else {
                    KarbonError::IoError(std::io::Error::new(kind, e.description))
                }
            }
            _ => KarbonError::SerialError(e.to_string()),
        }
    }
}

/// Exclusive-access failures surface differently per platform; match on both kind and text.
fn is_busy(kind: std::io::ErrorKind, description: &str) -> bool {
    let text = description.to_ascii_lowercase();
    matches!(
        kind,
        std::io::ErrorKind::ResourceBusy | std::io::ErrorKind::PermissionDenied
    ) && (text.contains("busy") || text.contains("access") || text.contains("in use"))
        || text.contains("resource busy")
}
