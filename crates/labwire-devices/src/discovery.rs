/*!
 * Device discovery for LabWire.
 *
 * Discovery providers list candidate ports; the device manager decides which
 * of them to connect to.
 */
use std::fmt::{self, Debug};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::Result;

/// Identity of a port that may host an instrument
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortInfo {
    /// OS port name
    pub port: String,
    /// USB vendor ID (0 when unknown)
    #[serde(rename = "VID")]
    pub vid: u16,
    /// USB product ID (0 when unknown)
    #[serde(rename = "PID")]
    pub pid: u16,
}

impl PortInfo {
    /// Create a port record
    pub fn new<S: Into<String>>(port: S, vid: u16, pid: u16) -> Self {
        Self {
            port: port.into(),
            vid,
            pid,
        }
    }
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:04x}:{:04x})", self.port, self.vid, self.pid)
    }
}

/// Device discovery trait
///
/// This trait defines the interface for discovery providers.
pub trait DeviceDiscovery: Send + Debug {
    /// Get the discovery provider name
    fn name(&self) -> &'static str;

    /// List the ports currently present
    fn scan(&self) -> Result<Vec<PortInfo>>;
}

/// A discovery provider returning a fixed list, for tests and static setups
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    ports: Vec<PortInfo>,
}

impl StaticDiscovery {
    /// Create a provider that always reports `ports`
    pub fn new(ports: Vec<PortInfo>) -> Self {
        Self { ports }
    }
}

impl DeviceDiscovery for StaticDiscovery {
    fn name(&self) -> &'static str {
        "static"
    }

    fn scan(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports.clone())
    }
}

/// Enumerates USB serial ports through the operating system
#[cfg(feature = "serial")]
#[derive(Debug, Clone, Default)]
pub struct SerialDiscovery {
    allowed: Vec<(u16, u16)>,
}

#[cfg(feature = "serial")]
impl SerialDiscovery {
    /// Create a provider reporting every USB serial port
    pub fn new() -> Self {
        Self::default()
    }

    /// Only report ports matching one of the given VID/PID pairs
    pub fn with_filter(mut self, vid: u16, pid: u16) -> Self {
        self.allowed.push((vid, pid));
        self
    }

    fn accepts(&self, vid: u16, pid: u16) -> bool {
        self.allowed.is_empty() || self.allowed.contains(&(vid, pid))
    }
}

#[cfg(feature = "serial")]
impl DeviceDiscovery for SerialDiscovery {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn scan(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?
            .into_iter()
            .filter_map(|port| match port.port_type {
                serialport::SerialPortType::UsbPort(usb) if self.accepts(usb.vid, usb.pid) => {
                    Some(PortInfo::new(port.port_name, usb.vid, usb.pid))
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        debug!("Serial discovery found {} port(s)", ports.len());
        Ok(ports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_info_wire_shape() {
        let info = PortInfo::new("/dev/ttyACM1", 0x2e8a, 0x000a);
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["port"], "/dev/ttyACM1");
        assert_eq!(value["VID"], 0x2e8a);
        assert_eq!(value["PID"], 0x000a);
        assert_eq!(info.to_string(), "/dev/ttyACM1 (2e8a:000a)");
    }

    #[test]
    fn test_static_discovery() {
        let discovery = StaticDiscovery::new(vec![PortInfo::new("COM3", 1, 2)]);
        assert_eq!(discovery.name(), "static");
        assert_eq!(discovery.scan().unwrap().len(), 1);
    }

    #[cfg(feature = "serial")]
    #[test]
    fn test_serial_filter() {
        let discovery = SerialDiscovery::new().with_filter(0x239a, 0x80f4);
        assert!(discovery.accepts(0x239a, 0x80f4));
        assert!(!discovery.accepts(0x2e8a, 0x000a));
        assert!(SerialDiscovery::new().accepts(1, 1));
    }
}
