//! Serial port handling
//!
//! Enumerates serial devices, picks out the MCU's CAN/terminal pair, and opens ports.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io::{Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::{
    ChannelKind, KarbonError, PortClaim, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, KARBON_PID,
    KARBON_VID,
};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyACM0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Manufacturer name (if available)
    pub manufacturer: Option<String>,

    /// Product name (if available)
    pub product: Option<String>,

    /// Serial number (if available)
    pub serial_number: Option<String>,
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        let (vid, pid, manufacturer, product, serial_number) = match info.port_type {
            SerialPortType::UsbPort(usb_info) => (
                Some(usb_info.vid),
                Some(usb_info.pid),
                usb_info.manufacturer,
                usb_info.product,
                usb_info.serial_number,
            ),
            _ => (None, None, None, None, None),
        };

        Self {
            name: info.port_name,
            vid,
            pid,
            manufacturer,
            product,
            serial_number,
        }
    }
}

/// A resolved port for one channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    /// Device path
    pub name: String,
    /// Role of the port on the MCU
    pub kind: ChannelKind,
}

impl PortRef {
    /// Reference to `name` in role `kind`
    pub fn new(name: impl Into<String>, kind: ChannelKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The MCU's two ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPair {
    /// CAN traffic port
    pub can: PortRef,
    /// Text command port
    pub terminal: PortRef,
}

/// How [`locate_with`] identifies the MCU's ports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocatorConfig {
    /// USB vendor id to match
    pub vid: u16,
    /// USB product id to match
    pub pid: u16,
    /// Ask each port for its firmware banner instead of trusting enumeration order.
    /// Opens both ports briefly.
    pub probe: bool,
    /// How long to wait for the banner when probing
    pub probe_timeout_ms: u64,
}

impl Default for LocatorConfig {
    fn default() -> Self {
        Self {
            vid: KARBON_VID,
            pid: KARBON_PID,
            probe: false,
            probe_timeout_ms: 200,
        }
    }
}

/// Helper used to sort port names so that:
///  - ttyACM* ports come first (sorted numerically by suffix)
///  - then ttyUSB* ports (sorted numerically)
///  - then COM ports (sorted numerically)
///  - then other ports (sorted by name)
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit(['/', '\\']).next().unwrap_or(name);
    for (rank, prefix) in [(0, "ttyACM"), (1, "ttyUSB"), (2, "COM")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (3, 0, basename.to_string())
}

/// List all available serial ports, with /dev fallbacks and deterministic ordering
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let p = PortInfo::from(info);
        map.entry(p.name.clone()).or_insert(p);
    }

    // Linux-only: Add /dev/ttyACM* entries if present but not found by API
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo {
                        name: full,
                        vid: None,
                        pid: None,
                        manufacturer: None,
                        product: None,
                        serial_number: None,
                    });
                }
            }
        }
    }

    let mut v: Vec<PortInfo> = map.into_values().collect();
    v.sort_by_key(|p| port_sort_key(&p.name));
    v
}

/// Find the MCU's CAN and terminal ports using the default USB ids
pub fn locate() -> Result<PortPair, KarbonError> {
    locate_with(&LocatorConfig::default())
}

/// Find the MCU's CAN and terminal ports
pub fn locate_with(config: &LocatorConfig) -> Result<PortPair, KarbonError> {
    let ports = list_ports();
    let pair = select_pair(&ports, config)?;

    if !config.probe {
        return Ok(pair);
    }

    let timeout = Duration::from_millis(config.probe_timeout_ms);
    match probe_port_kind(&pair.can.name, timeout)? {
        ChannelKind::Can => Ok(pair),
        ChannelKind::Terminal => {
            debug!("{} answered as terminal, swapping port roles", pair.can.name);
            Ok(PortPair {
                can: PortRef::new(pair.terminal.name, ChannelKind::Can),
                terminal: PortRef::new(pair.can.name, ChannelKind::Terminal),
            })
        }
    }
}

/// Pick the CAN/terminal pair out of an enumerated, sorted port list.
///
/// The MCU enumerates its CAN port first.
pub fn select_pair(ports: &[PortInfo], config: &LocatorConfig) -> Result<PortPair, KarbonError> {
    let matching: Vec<&PortInfo> = ports
        .iter()
        .filter(|p| p.vid == Some(config.vid) && p.pid == Some(config.pid))
        .collect();

    if matching.len() < 2 {
        return Err(KarbonError::PortNotFound(format!(
            "expected 2 ports with id {:04X}:{:04X}, found {}",
            config.vid,
            config.pid,
            matching.len()
        )));
    }

    for port in &matching[..2] {
        if PortClaim::is_claimed(&port.name) {
            return Err(KarbonError::PortBusy(port.name.clone()));
        }
    }

    let pair = PortPair {
        can: PortRef::new(matching[0].name.clone(), ChannelKind::Can),
        terminal: PortRef::new(matching[1].name.clone(), ChannelKind::Terminal),
    };
    info!("Located MCU ports: can={} terminal={}", pair.can.name, pair.terminal.name);
    Ok(pair)
}

/// Open a serial port the way the MCU expects: 8N1 with XON/XOFF flow control
pub fn open_port(
    name: &str,
    baud_rate: Option<u32>,
    timeout: Option<Duration>,
) -> Result<Box<dyn SerialPort>, KarbonError> {
    let baud = baud_rate.unwrap_or(DEFAULT_BAUD_RATE);
    let timeout = timeout.unwrap_or(Duration::from_millis(DEFAULT_READ_TIMEOUT_MS));

    let port = serialport::new(name, baud)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .flow_control(serialport::FlowControl::Software)
        .timeout(timeout)
        .open()?;
    debug!("Opened {} at {} baud", name, baud);
    Ok(port)
}

/// Ask a port for its firmware banner. Only the terminal answers with `<...>`.
pub fn probe_port_kind(name: &str, timeout: Duration) -> Result<ChannelKind, KarbonError> {
    let mut port = open_port(name, None, Some(Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)))?;
    port.write_all(b"version\r")?;

    let deadline = Instant::now() + timeout;
    let mut line = Vec::new();
    let mut buf = [0u8; 64];
    while Instant::now() < deadline {
        match port.read(&mut buf) {
            Ok(n) => {
                line.extend_from_slice(&buf[..n]);
                if line.iter().any(|b| *b == b'>') {
                    break;
                }
            }
            Err(e) if super::stream::is_idle(&e) => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(classify_banner(&line))
}

fn classify_banner(response: &[u8]) -> ChannelKind {
    let text = String::from_utf8_lossy(response);
    if text.contains('<') && text.contains('>') {
        ChannelKind::Terminal
    } else {
        ChannelKind::Can
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str, ids: Option<(u16, u16)>) -> PortInfo {
        PortInfo {
            name: name.to_string(),
            vid: ids.map(|i| i.0),
            pid: ids.map(|i| i.1),
            manufacturer: None,
            product: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_list_ports() {
        // This test just ensures the function doesn't panic
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
            "COM10",
            "COM3",
        ];
        let mut ports: Vec<PortInfo> = names.into_iter().map(|n| port(n, None)).collect();

        ports.sort_by_key(|p| port_sort_key(&p.name));
        let ordered: Vec<String> = ports.into_iter().map(|p| p.name).collect();

        assert_eq!(
            ordered,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "COM3",
                "COM10",
                "/dev/someport",
            ]
        );
    }

    #[test]
    fn test_select_pair_uses_usb_ids_and_order() {
        let ports = vec![
            port("/dev/ttyACM0", Some((0x2341, 0x0043))),
            port("/dev/ttyACM1", Some((KARBON_VID, KARBON_PID))),
            port("/dev/ttyACM2", Some((KARBON_VID, KARBON_PID))),
        ];
        let pair = select_pair(&ports, &LocatorConfig::default()).unwrap();
        assert_eq!(pair.can, PortRef::new("/dev/ttyACM1", ChannelKind::Can));
        assert_eq!(pair.terminal, PortRef::new("/dev/ttyACM2", ChannelKind::Terminal));
    }

    #[test]
    fn test_select_pair_requires_two_ports() {
        let ports = vec![port("/dev/ttyACM7", Some((KARBON_VID, KARBON_PID)))];
        assert!(matches!(
            select_pair(&ports, &LocatorConfig::default()),
            Err(KarbonError::PortNotFound(_))
        ));
    }

    #[test]
    fn test_select_pair_reports_claimed_port() {
        let ports = vec![
            port("/dev/ttyACM40", Some((KARBON_VID, KARBON_PID))),
            port("/dev/ttyACM41", Some((KARBON_VID, KARBON_PID))),
        ];
        let _claim = PortClaim::acquire("/dev/ttyACM41").unwrap();
        assert!(matches!(
            select_pair(&ports, &LocatorConfig::default()),
            Err(KarbonError::PortBusy(name)) if name == "/dev/ttyACM41"
        ));
    }

    #[test]
    fn test_classify_banner() {
        assert_eq!(classify_banner(b"<1.0.2.3 | Mar 04 2020>\r"), ChannelKind::Terminal);
        assert_eq!(classify_banner(b""), ChannelKind::Can);
        assert_eq!(classify_banner(b"123 11223344\r"), ChannelKind::Can);
    }
}
