use serialport::{SerialPortInfo, SerialPortType};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::transport::Transport;
use crate::error::ControlError;
use crate::protocol::{self, Command};
use crate::utils::{PollError, poll_with_timeout};

const BASE_SCORE: i32 = 100;
const DESCRIPTION_KEYWORDS: [&str; 6] = ["arduino", "mega", "uno", "ch340", "cp210", "ftdi"];
/// Arduino, CH340, CP210x, FTDI
const KNOWN_VIDS: [u16; 4] = [0x2341, 0x1A86, 0x10C4, 0x0403];
const HID_PATTERNS: [&str; 8] = [
    "mouse", "keyboard", "hid", "touchpad", "trackpad", "receiver", "dongle", "bluetooth",
];

/// What discovery needs to know about a port
#[derive(Debug, Clone, PartialEq)]
pub struct PortCandidate {
    pub name: String,
    pub description: String,
    pub vid: Option<u16>,
}

impl PortCandidate {
    pub fn new(name: &str, description: &str, vid: Option<u16>) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            vid,
        }
    }

    /// Lower is more likely to be the relay controller
    pub fn score(&self) -> i32 {
        let mut score = BASE_SCORE;
        let name = self.name.to_lowercase();
        let description = self.description.to_lowercase();

        if name.contains("/dev/ttyacm") {
            score -= 30;
        } else if name.contains("/dev/ttyusb") || name.contains("/dev/cu.usbmodem") {
            score -= 25;
        } else if name.contains("/dev/cu.usbserial") || name.starts_with("com") {
            score -= 20;
        }

        if DESCRIPTION_KEYWORDS.iter().any(|k| description.contains(k)) {
            score -= 15;
        }

        if self.vid.is_some_and(|vid| KNOWN_VIDS.contains(&vid)) {
            score -= 25;
        }
        score
    }

    /// Input devices that enumerate as serial ports are never probed
    pub fn is_hid(&self) -> bool {
        let description = self.description.to_lowercase();
        HID_PATTERNS.iter().any(|p| description.contains(p))
    }
}

impl From<SerialPortInfo> for PortCandidate {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => {
                let description = [usb.manufacturer, usb.product]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                Self {
                    name: info.port_name,
                    description,
                    vid: Some(usb.vid),
                }
            }
            SerialPortType::BluetoothPort => Self {
                name: info.port_name,
                description: "bluetooth".to_string(),
                vid: None,
            },
            _ => Self {
                name: info.port_name,
                description: String::new(),
                vid: None,
            },
        }
    }
}

/// Drop input devices and order the rest by likelihood. Stable for equal scores.
pub fn sort_by_likelihood(mut candidates: Vec<PortCandidate>) -> Vec<PortCandidate> {
    candidates.retain(|c| !c.is_hid());
    candidates.sort_by_key(|c| c.score());
    candidates
}

/// Last port that answered, remembered across runs
#[derive(Debug, Clone)]
pub struct PortCache {
    path: PathBuf,
}

impl PortCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// `~/.sputter_control/last_port`
    pub fn default_location() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".sputter_control").join("last_port")))
    }

    pub fn load(&self) -> Option<String> {
        fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn save(&self, port: &str) -> Result<(), ControlError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, port)?;
        Ok(())
    }

    pub fn clear(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Check that the controller firmware is behind `transport`.
///
/// Waits for `ARDUINO_READY` (a board that was already running may not send
/// it again), then requires a `STATUS` answer. A hazard token anywhere is a
/// [`ControlError::SafetyHalt`].
pub fn probe_controller(
    transport: &mut dyn Transport,
    ready_timeout: Duration,
    command_timeout: Duration,
) -> Result<bool, ControlError> {
    let ready = poll_with_timeout(
        || match transport.read_line()? {
            Some(line) if protocol::is_hazard(&line) => Err(ControlError::SafetyHalt(line)),
            Some(line) if line.contains(protocol::READY_TOKEN) => Ok(Some(())),
            Some(line) => {
                log::debug!("{}: ignoring '{}' before ready", transport.port_name(), line);
                Ok(None)
            }
            None => Ok(None),
        },
        ready_timeout,
        Duration::ZERO,
    );
    match ready {
        Ok(Some(())) => log::debug!("{} reported ready", transport.port_name()),
        Ok(None) => log::debug!("{}: no ready token, probing anyway", transport.port_name()),
        Err(PollError::ConditionError(e)) => return Err(e),
        Err(_) => {}
    }

    transport.write_line(&Command::Status.to_wire())?;
    let deadline = Instant::now() + command_timeout;
    while Instant::now() < deadline {
        match transport.read_line()? {
            Some(line) if protocol::is_hazard(&line) => {
                return Err(ControlError::SafetyHalt(line));
            }
            Some(line) if line.starts_with(protocol::STATUS_PREFIX) => {
                return Ok(protocol::parse_status(&line).is_ok());
            }
            _ => {}
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acm_arduino_ranks_first() {
        let ports = vec![
            PortCandidate::new("/dev/ttyS0", "", None),
            PortCandidate::new("/dev/ttyUSB0", "USB Serial CH340", Some(0x1A86)),
            PortCandidate::new("/dev/ttyACM0", "Arduino Mega 2560", Some(0x2341)),
            PortCandidate::new("/dev/ttyACM1", "Logitech USB Receiver", Some(0x046D)),
        ];
        let sorted = sort_by_likelihood(ports);
        let names: Vec<&str> = sorted.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["/dev/ttyACM0", "/dev/ttyUSB0", "/dev/ttyS0"]);
    }

    #[test]
    fn score_components() {
        assert_eq!(PortCandidate::new("/dev/ttyS0", "", None).score(), 100);
        assert_eq!(PortCandidate::new("COM3", "", None).score(), 80);
        assert_eq!(
            PortCandidate::new("/dev/ttyACM0", "Arduino Mega", Some(0x2341)).score(),
            100 - 30 - 15 - 25
        );
        assert_eq!(PortCandidate::new("/dev/cu.usbserial-1", "FTDI", Some(0x0403)).score(), 40);
    }

    #[test]
    fn cache_round_trip_and_clear() {
        let dir = std::env::temp_dir().join(format!("sputter-cache-{}", std::process::id()));
        let cache = PortCache::new(dir.join("last_port"));
        assert_eq!(cache.load(), None);
        cache.save("/dev/ttyACM0").unwrap();
        assert_eq!(cache.load().as_deref(), Some("/dev/ttyACM0"));
        cache.clear();
        assert_eq!(cache.load(), None);
        let _ = fs::remove_dir_all(dir);
    }
}
