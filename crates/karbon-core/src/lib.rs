//! # Karbon Core Library
//!
//! Host-side driver for the onboard microcontroller of Karbon industrial PCs.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! The MCU shows up as two USB serial ports. This library provides:
//! - Port discovery and exclusive claiming
//! - Sessions with a background reader thread and a bounded event queue
//! - Decoders for the CAN channel and the diagnostic terminal
//! - Reactions that answer CAN frames and digital-input changes automatically
//! - CAN bus baud rate detection
//!
//! ## Example
//!
//! ```rust,ignore
//! use karbon_core::prelude::*;
//!
//! let ports = locate()?;
//! let can = Session::open(&ports.can, SessionConfig::default())?;
//! let terminal = Session::open(&ports.terminal, SessionConfig::default())?;
//!
//! detect_baud(&can, Some(&terminal), BaudConfig::default())?;
//!
//! can.register(
//!     Matcher::CanId(0x123),
//!     |_| Ok(None),
//!     Some(CanFrame::new(0x124, vec![0x01])?.into()),
//! );
//! terminal.send(TerminalCommand::set_output(0, true))?;
//!
//! while let Ok(event) = can.recv_forever() {
//!     println!("{:?}", event);
//! }
//! ```

pub mod baud;
pub mod event;
pub mod protocol;
pub mod queue;
pub mod reaction;
pub mod session;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::baud::{detect_baud, BaudConfig, BaudDetector, BaudState, ProbeTarget};
    pub use crate::event::{CanFrame, DioState, Event, Outgoing};
    pub use crate::protocol::{
        list_ports, locate, locate_with, ChannelKind, CodecKind, KarbonError, LocatorConfig,
        PortPair, PortRef, TerminalCommand,
    };
    pub use crate::reaction::{DioPattern, Edge, ErrorSink, Matcher, ReactionId};
    pub use crate::session::{Session, SessionConfig, SessionState};
    pub use std::time::Duration;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
