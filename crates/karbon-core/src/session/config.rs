//! Session configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::{
    CodecKind, KarbonError, DEFAULT_BAUD_RATE, DEFAULT_CLOSE_TIMEOUT_MS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_READ_TIMEOUT_MS,
};

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host-side line rate of the virtual serial port
    pub baud_rate: u32,
    /// Reader thread read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Maximum number of undelivered events
    pub queue_capacity: usize,
    /// How long `close` waits for the reader thread
    pub close_timeout_ms: u64,
    /// Wire format
    pub codec: CodecKind,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            close_timeout_ms: DEFAULT_CLOSE_TIMEOUT_MS,
            codec: CodecKind::Auto,
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, KarbonError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| KarbonError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reader thread poll interval
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }

    /// Longest `close` waits for the reader thread
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_json_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "queue_capacity": 16, "codec": "binary_can" }}"#).unwrap();

        let config = SessionConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.codec, CodecKind::BinaryCan);
        assert_eq!(config.baud_rate, DEFAULT_BAUD_RATE);
        assert_eq!(config.read_timeout(), Duration::from_millis(DEFAULT_READ_TIMEOUT_MS));
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(
            SessionConfig::from_json_file(file.path()),
            Err(KarbonError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SessionConfig::from_json_file(dir.path().join("absent.json")),
            Err(KarbonError::IoError(_))
        ));
    }
}
