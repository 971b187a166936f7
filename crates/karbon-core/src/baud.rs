//! CAN baud rate detection
//!
//! Walks a list of candidate bus rates until traffic decodes cleanly. Each candidate is
//! applied, an optional probe frame is sent, and the detector waits a bounded time for a
//! structurally valid CAN frame.
//!
//! The MCU can also detect the rate itself (`can-autobaud`); [`request_device_autobaud`] asks
//! it to and reads back the result.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::event::{CanFrame, Event};
use crate::protocol::{ChannelKind, KarbonError, TerminalCommand};
use crate::session::Session;

/// Standard CAN bus rates, slowest first
pub const DEFAULT_CANDIDATES: [u32; 5] = [125_000, 250_000, 500_000, 800_000, 1_000_000];

/// Every rate the MCU's CAN controller supports
pub const STANDARD_RATES: [u32; 9] = [
    10_000, 20_000, 50_000, 100_000, 125_000, 250_000, 500_000, 800_000, 1_000_000,
];

/// Baud detection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaudConfig {
    /// Rates to try, in order
    pub candidates: Vec<u32>,
    /// How long to wait for a valid frame at each rate
    pub probe_timeout_ms: u64,
    /// Frame sent after switching rates. `None` listens passively.
    pub probe_frame: Option<CanFrame>,
}

impl Default for BaudConfig {
    fn default() -> Self {
        Self {
            candidates: DEFAULT_CANDIDATES.to_vec(),
            probe_timeout_ms: 250,
            probe_frame: None,
        }
    }
}

impl BaudConfig {
    /// [`BaudConfig::probe_timeout_ms`] as a duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Where detection stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudState {
    /// Not run yet
    Idle,
    /// Trying this rate
    Probing(u32),
    /// A valid frame arrived at this rate
    Detected(u32),
    /// No candidate produced a valid frame
    Failed,
}

/// Transport the detector drives
pub trait ProbeTarget {
    /// Switch the bus to `rate`
    fn apply_rate(&mut self, rate: u32) -> Result<(), KarbonError>;

    /// Send `frame` (if any) and report whether a valid frame arrived within `timeout`
    fn probe(&mut self, frame: Option<&CanFrame>, timeout: Duration) -> Result<bool, KarbonError>;

    /// Called once with the detected rate, if there is one
    fn finish(&mut self, _detected: Option<u32>) -> Result<(), KarbonError> {
        Ok(())
    }
}

/// Candidate-walking detector
#[derive(Debug, Clone)]
pub struct BaudDetector {
    config: BaudConfig,
    state: BaudState,
    probes: usize,
}

impl BaudDetector {
    /// Idle detector over `config`
    pub fn new(config: BaudConfig) -> Self {
        Self {
            config,
            state: BaudState::Idle,
            probes: 0,
        }
    }

    /// Where the last run stopped
    pub fn state(&self) -> BaudState {
        self.state
    }

    /// Probes sent in the last run
    pub fn probes(&self) -> usize {
        self.probes
    }

    /// Try each candidate in order and stop at the first that yields a valid frame
    pub fn run<T: ProbeTarget + ?Sized>(&mut self, target: &mut T) -> Result<BaudState, KarbonError> {
        self.probes = 0;
        let timeout = self.config.probe_timeout();

        for &rate in &self.config.candidates {
            self.state = BaudState::Probing(rate);
            debug!("Probing CAN bus at {} bps", rate);

            let outcome = target
                .apply_rate(rate)
                .and_then(|_| target.probe(self.config.probe_frame.as_ref(), timeout));
            self.probes += 1;

            match outcome {
                Ok(true) => {
                    self.state = BaudState::Detected(rate);
                    target.finish(Some(rate))?;
                    info!("Detected CAN bus rate {} bps after {} probes", rate, self.probes);
                    return Ok(self.state);
                }
                Ok(false) => {}
                Err(e) => {
                    self.state = BaudState::Failed;
                    return Err(e);
                }
            }
        }

        self.state = BaudState::Failed;
        target.finish(None)?;
        warn!("No CAN traffic at any of {:?}", self.config.candidates);
        Ok(self.state)
    }
}

/// Probe through a live CAN session.
///
/// Reaction dispatch on the CAN session is suspended while the probe exists. Rates go to the
/// MCU with `set can-baudrate` when a terminal session is given, otherwise the channel itself
/// is reconfigured.
pub struct SessionProbe<'a> {
    can: &'a Session,
    terminal: Option<&'a Session>,
}

impl<'a> SessionProbe<'a> {
    /// Probe `can` by reconfiguring its channel
    pub fn new(can: &'a Session) -> Self {
        can.set_bootstrap(true);
        Self {
            can,
            terminal: None,
        }
    }

    /// Probe `can`, setting rates on the MCU through `terminal`
    pub fn with_terminal(can: &'a Session, terminal: &'a Session) -> Self {
        let mut probe = Self::new(can);
        probe.terminal = Some(terminal);
        probe
    }
}

impl ProbeTarget for SessionProbe<'_> {
    fn apply_rate(&mut self, rate: u32) -> Result<(), KarbonError> {
        match self.terminal {
            Some(terminal) => terminal.send(TerminalCommand::SetCanBaudrate(rate))?,
            None => self.can.reconfigure_channel(rate)?,
        }
        // Anything queued was received at the previous rate
        self.can.drain();
        Ok(())
    }

    fn probe(&mut self, frame: Option<&CanFrame>, timeout: Duration) -> Result<bool, KarbonError> {
        if let Some(frame) = frame {
            self.can.send(frame.clone())?;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.can.recv(remaining) {
                Ok(Event::CanFrame(_)) => return Ok(true),
                Ok(_) => continue,
                Err(KarbonError::Timeout) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    fn finish(&mut self, detected: Option<u32>) -> Result<(), KarbonError> {
        if let Some(rate) = detected {
            self.can.set_can_baud(rate);
        }
        Ok(())
    }
}

impl Drop for SessionProbe<'_> {
    fn drop(&mut self) {
        self.can.set_bootstrap(false);
    }
}

/// Detect the bus rate of `can`, applying candidates through `terminal` when given
pub fn detect_baud(
    can: &Session,
    terminal: Option<&Session>,
    config: BaudConfig,
) -> Result<BaudState, KarbonError> {
    let mut probe = match terminal {
        Some(terminal) => SessionProbe::with_terminal(can, terminal),
        None => SessionProbe::new(can),
    };
    BaudDetector::new(config).run(&mut probe)
}

/// Ask the MCU to detect the bus rate itself. Returns the rate in bits per second.
///
/// Only a `can-baudrate` entry or a line holding a standard CAN rate is taken as the answer;
/// anything else the terminal reports meanwhile stays queued.
pub fn request_device_autobaud(terminal: &Session, timeout: Duration) -> Result<u32, KarbonError> {
    expect_terminal(terminal)?;
    terminal.send(TerminalCommand::CanAutobaud)?;

    let rate = terminal.recv_matching(timeout, |event| match event {
        Event::TerminalLine { text } => parse_rate(text),
        Event::ConfigEntry { key, value } if key == "can-baudrate" => parse_rate(value),
        _ => None,
    })?;
    info!("MCU reports CAN bus rate {} bps", rate);
    Ok(rate)
}

/// Set the MCU's CAN bus rate
pub fn set_device_baud(terminal: &Session, rate: u32) -> Result<(), KarbonError> {
    expect_terminal(terminal)?;
    terminal.send(TerminalCommand::SetCanBaudrate(rate))
}

fn expect_terminal(session: &Session) -> Result<(), KarbonError> {
    if session.kind() != ChannelKind::Terminal {
        return Err(KarbonError::Unsupported("baud command on a CAN session"));
    }
    Ok(())
}

/// The terminal reports rates in kbit/s (`500`, `500k`, `500 kbps`); larger numbers are bit/s.
/// Anything that is not a whole number naming a standard rate is rejected.
fn parse_rate(text: &str) -> Option<u32> {
    let text = text.trim().to_ascii_lowercase();
    let (number, scale) = match text.strip_suffix("bps") {
        Some(rest) => match rest.trim_end().strip_suffix('k') {
            Some(kilo) => (kilo, 1000),
            None => (rest, 1),
        },
        None => match text.strip_suffix('k') {
            Some(kilo) => (kilo, 1000),
            None => (text.as_str(), 0),
        },
    };
    let number = number.trim_end();
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let value: u32 = number.parse().ok()?;
    let rate = match scale {
        0 if value < 10_000 => value.checked_mul(1000)?,
        0 => value,
        scale => value.checked_mul(scale)?,
    };
    STANDARD_RATES.contains(&rate).then_some(rate)
}
