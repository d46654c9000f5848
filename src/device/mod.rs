//! Per-device lifecycle: roster parsing, connection state machine, health
//! checking, and auto-reconnect.

mod manager;

pub use manager::DeviceManager;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device not connected: {0}")]
    NotConnected(String),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("bridge failure: {0}")]
    BridgeFailure(#[from] crate::bridge::BridgeError),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("roster file error: {0}")]
    RosterFile(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// The device lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Known from the roster but never successfully connected.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Bridge reports the device present and healthy.
    Connected,
    /// A script is currently running against this device.
    Running,
    /// Connection was lost; auto-reconnect (if enabled) will retry.
    Reconnecting,
    /// Roster entry is disabled or otherwise permanently unusable.
    Failed,
}

impl DeviceState {
    /// Valid transitions out of each state, matching the health loop and
    /// step executor's handshake with the device manager.
    pub fn can_transition_to(self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Failed)
                | (Connected, Running)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Running, Connected)
                | (Running, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
                | (Reconnecting, Failed)
                | (Failed, Connecting)
        )
    }
}

/// One entry from the device roster, plus live status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: String,
    pub name: String,
    /// `Some((host, port))` for network devices; `None` for a bare local
    /// serial (USB-attached) device.
    pub address: Option<(String, u16)>,
    pub state: DeviceState,
    pub last_connection_attempt_epoch_s: u64,
    pub connection_attempts: u32,
    pub current_action: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    /// `getprop ro.product.model`, cached on connect.
    pub model: Option<String>,
    /// `getprop ro.build.version.release`, cached on connect.
    pub os_version: Option<String>,
    /// Passed through from a script's `dependencies` field for the script
    /// last run against this device; informational only.
    pub dependencies: Vec<String>,
}

impl DeviceRecord {
    pub fn new(id: String, name: String, address: Option<(String, u16)>) -> Self {
        Self {
            id,
            name,
            address,
            state: DeviceState::Disconnected,
            last_connection_attempt_epoch_s: 0,
            connection_attempts: 0,
            current_action: None,
            screen_width: None,
            screen_height: None,
            model: None,
            os_version: None,
            dependencies: Vec::new(),
        }
    }

    pub fn is_network(&self) -> bool {
        self.address.is_some()
    }

    pub fn mark_attempt(&mut self) {
        self.last_connection_attempt_epoch_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.connection_attempts += 1;
    }
}

/// Parses one roster line: `host:port[:name]` (network) or `serial[:name]`
/// (local — a single token with no colon, or a serial string containing a
/// colon is ambiguous and treated as `host:port` per the two-colon rule
/// below).
///
/// Disambiguation: a one-colon line is `host:port` only if the second field
/// parses as a `u16`; otherwise (e.g. `emulator-5554:my-device`) it falls
/// back to local-serial-with-name. A lone first token (no colon at all) is
/// a local serial with no name override.
pub fn parse_roster_line(line: &str) -> Option<DeviceRecord> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let parts: Vec<&str> = line.split(':').collect();
    match parts.as_slice() {
        [serial] => {
            let id = serial.to_string();
            Some(DeviceRecord::new(id.clone(), id, None))
        }
        [serial, name] if name.parse::<u16>().is_err() => {
            Some(DeviceRecord::new(serial.to_string(), name.to_string(), None))
        }
        [host, port_str, rest @ ..] => {
            let port: u16 = port_str.parse().ok()?;
            let id = format!("{host}:{port}");
            let name = rest.first().map(|s| s.to_string()).unwrap_or_else(|| id.clone());
            Some(DeviceRecord::new(id, name, Some((host.to_string(), port))))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_network_device_without_name() {
        let record = parse_roster_line("192.168.1.50:5555").unwrap();
        assert_eq!(record.id, "192.168.1.50:5555");
        assert_eq!(record.name, "192.168.1.50:5555");
        assert_eq!(record.address, Some(("192.168.1.50".to_string(), 5555)));
    }

    #[test]
    fn parses_network_device_with_name() {
        let record = parse_roster_line("192.168.1.50:5555:emu-1").unwrap();
        assert_eq!(record.name, "emu-1");
    }

    #[test]
    fn parses_local_serial() {
        let record = parse_roster_line("emulator-5554").unwrap();
        assert_eq!(record.id, "emulator-5554");
        assert!(!record.is_network());
    }

    #[test]
    fn parses_local_serial_with_name_when_second_field_not_numeric() {
        let record = parse_roster_line("emulator-5554:my-device").unwrap();
        assert_eq!(record.id, "emulator-5554");
        assert_eq!(record.name, "my-device");
        assert!(!record.is_network());
    }

    #[test]
    fn skips_comments_and_blank_lines() {
        assert!(parse_roster_line("# a comment").is_none());
        assert!(parse_roster_line("   ").is_none());
    }

    #[test]
    fn valid_state_transitions() {
        assert!(DeviceState::Disconnected.can_transition_to(DeviceState::Connecting));
        assert!(!DeviceState::Disconnected.can_transition_to(DeviceState::Running));
    }
}
