//! Serial port discovery for radio programming cables.
//!
//! Nothing here opens a port. Discovery only lists candidates; the user
//! (or the CLI on their behalf) picks one and hands it to
//! [`crate::connection::ConnectionManager::connect`].

use std::fmt;

use crate::error::{Error, Result};

#[cfg(feature = "native")]
use log::{debug, info, trace};

/// USB-UART bridges found in K5/TK11 programming cables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DeviceKind {
    /// CH340/CH341, the usual Kenwood-plug cable.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232 family.
    Ftdi,
    /// Prolific PL2303, common in older cables.
    Prolific,
    /// Anything else.
    Unknown,
}

/// Known USB VID/PID pairs.
const KNOWN_BRIDGES: &[(u16, &[u16], DeviceKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        DeviceKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], DeviceKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        DeviceKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], DeviceKind::Prolific),
];

impl DeviceKind {
    /// Classify a USB VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Marketing name of the bridge chip.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "unknown bridge",
        }
    }

    /// Whether this is a recognised cable bridge.
    pub fn is_known(&self) -> bool {
        self != &Self::Unknown
    }

    /// Preference during auto-selection; lower wins.
    fn rank(self) -> u8 {
        match self {
            Self::Ch340 => 0,
            Self::Prolific => 1,
            Self::Cp210x | Self::Ftdi => 2,
            Self::Unknown => 3,
        }
    }
}

/// One enumerated serial port.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedPort {
    /// Port path (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: String,
    /// Classified bridge.
    pub device: DeviceKind,
    /// USB Vendor ID, if USB.
    pub vid: Option<u16>,
    /// USB Product ID, if USB.
    pub pid: Option<u16>,
    /// Manufacturer string, if reported.
    pub manufacturer: Option<String>,
    /// Product string, if reported.
    pub product: Option<String>,
    /// Serial number, if reported.
    pub serial: Option<String>,
}

impl DetectedPort {
    /// Port with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device: DeviceKind::Unknown,
            vid: None,
            pid: None,
            manufacturer: None,
            product: None,
            serial: None,
        }
    }

    /// Whether this looks like a programming cable.
    pub fn is_likely_cable(&self) -> bool {
        self.device.is_known()
    }
}

/// Enumerate serial ports.
#[cfg(feature = "native")]
pub fn detect_ports() -> Vec<DetectedPort> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|info| {
                let mut detected = DetectedPort::named(info.port_name);
                if let serialport::SerialPortType::UsbPort(usb) = info.port_type {
                    detected.device = DeviceKind::from_vid_pid(usb.vid, usb.pid);
                    trace!("{} is USB {:04X}:{:04X}", detected.name, usb.vid, usb.pid);
                    detected.vid = Some(usb.vid);
                    detected.pid = Some(usb.pid);
                    detected.manufacturer = usb.manufacturer;
                    detected.product = usb.product;
                    detected.serial = usb.serial_number;
                }
                detected
            })
            .collect(),
        Err(e) => {
            debug!("Port enumeration failed: {e}");
            Vec::new()
        },
    }
}

/// Enumerate serial ports (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn detect_ports() -> Vec<DetectedPort> {
    Vec::new()
}

/// Pick the best candidate from `ports`: known bridges first, CH340 first
/// among them, otherwise the first port listed.
pub fn select_best(ports: &[DetectedPort]) -> Option<&DetectedPort> {
    ports.iter().min_by_key(|p| p.device.rank())
}

/// Pick one port automatically.
#[cfg(feature = "native")]
pub fn auto_detect_port() -> Result<DetectedPort> {
    let ports = detect_ports();
    let port = select_best(&ports).ok_or(Error::DeviceNotFound)?;
    if port.is_likely_cable() {
        info!("Auto-detected cable {port}");
    } else {
        info!("No known cable bridge, falling back to {port}");
    }
    Ok(port.clone())
}

/// Pick one port automatically (no serial backend compiled in).
#[cfg(not(feature = "native"))]
pub fn auto_detect_port() -> Result<DetectedPort> {
    Err(Error::Unsupported(
        "port enumeration needs the `native` feature".to_string(),
    ))
}

impl fmt::Display for DetectedPort {
    /// `name [bridge] - product`, with raw IDs for unknown USB bridges.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        match (self.device, self.vid.zip(self.pid)) {
            (DeviceKind::Unknown, Some((vid, pid))) => write!(f, " [VID:{vid:04X} PID:{pid:04X}]")?,
            (DeviceKind::Unknown, None) => {},
            (kind, _) => write!(f, " [{}]", kind.name())?,
        }
        if let Some(product) = &self.product {
            write!(f, " - {product}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb(name: &str, vid: u16, pid: u16) -> DetectedPort {
        DetectedPort {
            device: DeviceKind::from_vid_pid(vid, pid),
            vid: Some(vid),
            pid: Some(pid),
            ..DetectedPort::named(name)
        }
    }

    #[test]
    fn test_bridge_classification() {
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x7523), DeviceKind::Ch340);
        assert_eq!(DeviceKind::from_vid_pid(0x10C4, 0xEA60), DeviceKind::Cp210x);
        assert_eq!(DeviceKind::from_vid_pid(0x0403, 0x6001), DeviceKind::Ftdi);
        assert_eq!(DeviceKind::from_vid_pid(0x067B, 0x2303), DeviceKind::Prolific);
        assert_eq!(DeviceKind::from_vid_pid(0x1A86, 0x0001), DeviceKind::Unknown);
        assert_eq!(DeviceKind::from_vid_pid(0x1234, 0x5678), DeviceKind::Unknown);
    }

    #[test]
    fn test_select_best_prefers_ch340() {
        let ports = vec![
            DetectedPort::named("/dev/ttyS0"),
            usb("/dev/ttyUSB0", 0x0403, 0x6001),
            usb("/dev/ttyUSB1", 0x1A86, 0x7523),
        ];
        assert_eq!(select_best(&ports).unwrap().name, "/dev/ttyUSB1");

        let plain = vec![DetectedPort::named("/dev/ttyS0"), DetectedPort::named("/dev/ttyS1")];
        assert_eq!(select_best(&plain).unwrap().name, "/dev/ttyS0");
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn test_display_describes_bridge() {
        let mut cable = usb("/dev/ttyUSB0", 0x1A86, 0x7523);
        cable.product = Some("USB Serial".to_string());
        let pico = usb("/dev/ttyACM0", 0x2E8A, 0x000A);

        assert_eq!(cable.to_string(), "/dev/ttyUSB0 [CH340/CH341] - USB Serial");
        assert_eq!(pico.to_string(), "/dev/ttyACM0 [VID:2E8A PID:000A]");
        assert_eq!(DetectedPort::named("/dev/ttyS0").to_string(), "/dev/ttyS0");
        assert!(cable.is_likely_cable());
        assert!(!pico.is_likely_cable());
    }
}
