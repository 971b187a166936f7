//! Karbon MCU Monitor
//!
//! Finds the MCU, opens both ports and prints every event until interrupted.
//!
//! Usage:
//!   cargo run --example monitor -- [OPTIONS]
//!
//! Options:
//!   --can PORT        CAN port (default: located by USB id)
//!   --terminal PORT   Terminal port (default: located by USB id)
//!   --probe           Identify ports by firmware banner instead of enumeration order
//!   --autobaud        Detect the CAN bus rate before monitoring
//!   --echo ID         Answer frames with this id (hex) with a remote request
//!
//! Set RUST_LOG=karbon_core=debug for driver logs.

use std::thread;
use std::time::Duration;

use karbon_core::baud::request_device_autobaud;
use karbon_core::prelude::*;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut can_port: Option<String> = None;
    let mut terminal_port: Option<String> = None;
    let mut probe = false;
    let mut autobaud = false;
    let mut echo_id: Option<u32> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--can" => {
                i += 1;
                can_port = args.get(i).cloned();
            }
            "--terminal" => {
                i += 1;
                terminal_port = args.get(i).cloned();
            }
            "--probe" => probe = true,
            "--autobaud" => autobaud = true,
            "--echo" => {
                i += 1;
                echo_id = args
                    .get(i)
                    .and_then(|s| u32::from_str_radix(s.trim_start_matches("0x"), 16).ok());
            }
            "--help" | "-h" => {
                print_help();
                return;
            }
            other => {
                eprintln!("Unknown option: {}", other);
                print_help();
                return;
            }
        }
        i += 1;
    }

    let ports = match (can_port, terminal_port) {
        (Some(can), Some(terminal)) => PortPair {
            can: PortRef::new(can, ChannelKind::Can),
            terminal: PortRef::new(terminal, ChannelKind::Terminal),
        },
        _ => match locate_with(&LocatorConfig {
            probe,
            ..LocatorConfig::default()
        }) {
            Ok(pair) => pair,
            Err(e) => {
                eprintln!("Could not find the MCU: {}", e);
                for port in list_ports() {
                    eprintln!("  {} {:04X?}:{:04X?}", port.name, port.vid, port.pid);
                }
                return;
            }
        },
    };

    if let Err(e) = run(&ports, autobaud, echo_id) {
        eprintln!("Error: {}", e);
    }
}

fn run(ports: &PortPair, autobaud: bool, echo_id: Option<u32>) -> Result<(), KarbonError> {
    let terminal = Session::open(&ports.terminal, SessionConfig::default())?;
    let can = Session::open(&ports.can, SessionConfig::default())?;

    terminal.send(TerminalCommand::Version)?;
    terminal.send(TerminalCommand::Config)?;

    if autobaud {
        let rate = request_device_autobaud(&terminal, Duration::from_secs(5))?;
        can.set_can_baud(rate);
        println!("CAN bus rate: {} bps", rate);
    }

    if let Some(id) = echo_id {
        can.register(Matcher::CanId(id), |_| Ok(None), Some(Outgoing::Remote { id, len: 8 }));
    }

    thread::scope(|scope| {
        scope.spawn(|| print_events("terminal", &terminal));
        print_events("can", &can);
    });
    Ok(())
}

fn print_events(label: &str, session: &Session) {
    loop {
        match session.recv_forever() {
            Ok(Event::CanFrame(frame)) => println!(
                "[{}] {:>8x} {}",
                label,
                frame.id,
                frame
                    .payload
                    .iter()
                    .map(|b| format!("{:02x}", b))
                    .collect::<String>()
            ),
            Ok(Event::Dio(state)) => println!("[{}] dio {}", label, state),
            Ok(Event::ConfigEntry { key, value }) => println!("[{}] {} = {}", label, key, value),
            Ok(Event::TerminalLine { text }) => println!("[{}] {}", label, text),
            Err(e) => {
                println!("[{}] stopped: {}", label, e);
                return;
            }
        }
    }
}

fn print_help() {
    println!(
        r#"Karbon MCU Monitor

Usage: monitor [OPTIONS]

Options:
  --can PORT        CAN port (default: located by USB id)
  --terminal PORT   Terminal port (default: located by USB id)
  --probe           Identify ports by firmware banner
  --autobaud        Ask the MCU to detect the CAN bus rate first
  --echo ID         Answer frames with this id (hex) with a remote request
  -h, --help        Show this help
"#
    );
}
