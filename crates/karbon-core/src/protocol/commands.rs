//! Terminal commands
//!
//! Defines the commands understood by the MCU's diagnostic terminal.

use serde::{Deserialize, Serialize};

/// Commands for the terminal channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminalCommand {
    /// Report firmware version and build (`<version | build>`)
    Version,

    /// Dump the user configuration, one `Key: value` line per parameter
    Config,

    /// Report digital IO state (`iiii oooo`)
    DioState,

    /// Set digital outputs; `None` leaves a pin untouched
    SetOutputs([Option<bool>; 4]),

    /// Change a configuration parameter
    SetParam {
        /// Parameter name as the terminal spells it
        key: String,
        /// New value
        value: String,
    },

    /// Persist the current configuration
    SaveConfig,

    /// Report system input voltage
    GetVoltage,

    /// Let the MCU detect the CAN bus rate itself
    CanAutobaud,

    /// Set the CAN bus rate, in bits per second
    SetCanBaudrate(u32),
}

impl TerminalCommand {
    /// Set a single output, leaving the others alone
    pub fn set_output(pin: u8, high: bool) -> Self {
        let mut states = [None; 4];
        if let Some(slot) = states.get_mut(pin as usize) {
            *slot = Some(high);
        }
        TerminalCommand::SetOutputs(states)
    }

    /// The command text, without terminator
    pub fn to_line(&self) -> String {
        match self {
            TerminalCommand::Version => "version".to_string(),
            TerminalCommand::Config => "config".to_string(),
            TerminalCommand::DioState => "dio-state".to_string(),
            TerminalCommand::SetOutputs(states) => {
                let pins: String = states
                    .iter()
                    .map(|s| match s {
                        Some(true) => '1',
                        Some(false) => '0',
                        None => '-',
                    })
                    .collect();
                format!("set-do {}", pins)
            }
            TerminalCommand::SetParam { key, value } => format!("set {} {}", key, value),
            TerminalCommand::SaveConfig => "save-config".to_string(),
            TerminalCommand::GetVoltage => "get-voltage".to_string(),
            TerminalCommand::CanAutobaud => "can-autobaud".to_string(),
            // The terminal takes the rate in kbit/s
            TerminalCommand::SetCanBaudrate(rate) => format!("set can-baudrate {}", rate / 1000),
        }
    }
}
