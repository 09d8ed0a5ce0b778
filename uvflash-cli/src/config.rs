//! Settings files.
//!
//! Two TOML files feed the CLI, later ones overriding earlier ones:
//! the per-user `config.toml` in the platform config directory, then
//! `uvflash.toml` in the working directory. `--config PATH` replaces
//! both. Flags and `UVFLASH_*` variables sit above every file.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// File name looked up in the working directory.
pub const LOCAL_CONFIG: &str = "uvflash.toml";

const GLOBAL_CONFIG: &str = "config.toml";

/// A cable the user has vouched for, by USB identity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    pub vid: u16,
    pub pid: u16,
}

impl UsbDevice {
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        (self.vid, self.pid) == (vid, pid)
    }
}

/// `[port.connection]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Device path such as `/dev/ttyUSB0` or `COM3`.
    pub serial: Option<String>,
    pub baud: Option<u32>,
}

/// `[port]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// `[[port.usb_device]]` entries, preferred during auto-detection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// `[radio]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RadioConfig {
    /// `k5`, `k1` or `tk11`.
    pub family: Option<String>,
}

/// `[firmware]`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    /// Refuse packed images whose trailing CRC is missing or wrong.
    #[serde(default)]
    pub require_crc: bool,
}

/// Everything the settings files can hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub port: PortConfig,
    #[serde(default)]
    pub radio: RadioConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
}

/// Parse one settings file. Missing files are silent, broken ones warn.
fn read_layer(path: &Path) -> Option<Config> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Ignoring {}: {e}", path.display());
            return None;
        },
    };
    toml::from_str(&text)
        .map_err(|e| warn!("Ignoring {}: {e}", path.display()))
        .ok()
}

fn add_device(devices: &mut Vec<UsbDevice>, device: UsbDevice) {
    if !devices.contains(&device) {
        devices.push(device);
    }
}

impl Config {
    /// Per-user file layered under the working-directory file.
    pub fn load() -> Self {
        let layers = [Self::global_config_path(), Some(PathBuf::from(LOCAL_CONFIG))];
        layers
            .into_iter()
            .flatten()
            .filter_map(|path| {
                let layer = read_layer(&path)?;
                debug!("Config layer {}", path.display());
                Some(layer)
            })
            .fold(Self::default(), |mut acc, layer| {
                acc.overlay(layer);
                acc
            })
    }

    /// Only the file given with `--config`.
    pub fn load_from_path(path: &Path) -> Self {
        read_layer(path).unwrap_or_else(|| {
            warn!("No usable settings in {}, continuing with defaults", path.display());
            Self::default()
        })
    }

    /// Per-user settings file, when the platform has a config directory.
    pub fn global_config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "uvflash").map(|dirs| dirs.config_dir().join(GLOBAL_CONFIG))
    }

    /// Apply the values `top` sets on top of ours.
    fn overlay(&mut self, top: Self) {
        let conn = &mut self.port.connection;
        conn.serial = top.port.connection.serial.or(conn.serial.take());
        conn.baud = top.port.connection.baud.or(conn.baud);
        for device in top.port.usb_device {
            add_device(&mut self.port.usb_device, device);
        }
        self.radio.family = top.radio.family.or(self.radio.family.take());
        self.firmware.require_crc |= top.firmware.require_crc;
    }

    /// Persist `serial` (plus its USB identity) to `./uvflash.toml`.
    pub fn remember_port(
        &mut self,
        serial: &str,
        vid: Option<u16>,
        pid: Option<u16>,
    ) -> anyhow::Result<PathBuf> {
        let path = PathBuf::from(LOCAL_CONFIG);
        self.remember_port_in(&path, serial, vid, pid)?;
        Ok(path)
    }

    fn remember_port_in(
        &mut self,
        path: &Path,
        serial: &str,
        vid: Option<u16>,
        pid: Option<u16>,
    ) -> anyhow::Result<()> {
        let mut file = read_layer(path).unwrap_or_default();
        file.port.connection.serial = Some(serial.to_owned());
        if let (Some(vid), Some(pid)) = (vid, pid) {
            add_device(&mut file.port.usb_device, UsbDevice { vid, pid });
        }

        fs::write(path, toml::to_string_pretty(&file)?)?;
        info!("Remembered {serial} in {}", path.display());

        self.overlay(file);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH340: UsbDevice = UsbDevice {
        vid: 0x1A86,
        pid: 0x7523,
    };

    #[test]
    fn test_empty_config_sets_nothing() {
        let config = Config::default();
        assert_eq!(config.port.connection.serial, None);
        assert_eq!(config.port.connection.baud, None);
        assert!(config.port.usb_device.is_empty());
        assert_eq!(config.radio.family, None);
        assert!(!config.firmware.require_crc);
    }

    #[test]
    fn test_usb_identity() {
        assert!(CH340.matches(0x1A86, 0x7523));
        assert!(!CH340.matches(0x1A86, 0x7522));
        assert!(!CH340.matches(0x10C4, 0x7523));
    }

    #[test]
    fn test_overlay_keeps_unset_values() {
        let mut below = Config::default();
        below.port.connection.serial = Some("/dev/ttyACM1".into());
        below.port.connection.baud = Some(38400);
        below.radio.family = Some("k5".into());

        let mut above = Config::default();
        above.port.connection.baud = Some(57600);
        above.radio.family = Some("tk11".into());
        above.firmware.require_crc = true;
        below.overlay(above);

        assert_eq!(below.port.connection.serial.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(below.port.connection.baud, Some(57600));
        assert_eq!(below.radio.family.as_deref(), Some("tk11"));
        assert!(below.firmware.require_crc);

        // An empty layer changes nothing, and require_crc never switches back off
        below.overlay(Config::default());
        assert_eq!(below.radio.family.as_deref(), Some("tk11"));
        assert!(below.firmware.require_crc);
    }

    #[test]
    fn test_overlay_unions_cables() {
        let mut below = Config::default();
        below.port.usb_device.push(CH340);

        let mut above = Config::default();
        above.port.usb_device = vec![CH340, UsbDevice {
            vid: 0x10C4,
            pid: 0xEA60,
        }];
        below.overlay(above);

        assert_eq!(below.port.usb_device.len(), 2);
    }

    #[test]
    fn test_full_file_parses() {
        let text = r#"
[port.connection]
serial = "/dev/ttyUSB0"
baud = 38400

[[port.usb_device]]
vid = 6790
pid = 29987

[radio]
family = "k1"

[firmware]
require_crc = true
"#;
        let config: Config = toml::from_str(text).unwrap();
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.port.connection.baud, Some(38400));
        assert_eq!(config.port.usb_device, vec![CH340]);
        assert_eq!(config.radio.family.as_deref(), Some("k1"));
        assert!(config.firmware.require_crc);
    }

    #[test]
    fn test_sections_are_optional() {
        let only_radio: Config = toml::from_str("[radio]\nfamily = \"tk11\"\n").unwrap();
        assert_eq!(only_radio.port.connection.serial, None);
        assert_eq!(only_radio.radio.family.as_deref(), Some("tk11"));
        assert!(!only_radio.firmware.require_crc);

        let blank: Config = toml::from_str("").unwrap();
        assert_eq!(blank.radio.family, None);
    }

    #[test]
    fn test_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.toml");
        fs::write(&path, "[port.connection]\nserial = \"COM7\"\n").unwrap();
        assert_eq!(
            Config::load_from_path(&path).port.connection.serial.as_deref(),
            Some("COM7")
        );

        let absent = Config::load_from_path(&dir.path().join("absent.toml"));
        assert_eq!(absent.port.connection.serial, None);
    }

    #[test]
    fn test_unparsable_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[port\nserial = ").unwrap();
        assert_eq!(Config::load_from_path(&path).port.connection.serial, None);
    }

    #[test]
    fn test_remembering_a_port_preserves_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCAL_CONFIG);
        fs::write(&path, "[radio]\nfamily = \"tk11\"\n").unwrap();

        let mut config = Config::default();
        for _ in 0..2 {
            config
                .remember_port_in(&path, "/dev/ttyUSB3", Some(CH340.vid), Some(CH340.pid))
                .unwrap();
        }

        let saved = Config::load_from_path(&path);
        assert_eq!(saved.port.connection.serial.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(saved.port.usb_device, vec![CH340]);
        assert_eq!(saved.radio.family.as_deref(), Some("tk11"));
        assert_eq!(config.port.connection.serial.as_deref(), Some("/dev/ttyUSB3"));
    }

    #[test]
    fn test_per_user_file_location() {
        if let Some(path) = Config::global_config_path() {
            assert!(path.ends_with("config.toml"));
            assert!(path.to_string_lossy().contains("uvflash"));
        }
    }
}
