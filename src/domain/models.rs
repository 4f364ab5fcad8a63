use serde::{Deserialize, Serialize};
use std::fmt;

/// A sensor seen during the current scan session.
///
/// Identity is `id`; the set of devices is rebuilt on every scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub display_name: Option<String>,
    pub signal_strength: i16,
}

impl Device {
    pub fn new(id: impl Into<String>, display_name: Option<String>, signal_strength: i16) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.filter(|n| !n.trim().is_empty()),
            signal_strength,
        }
    }

    /// Advertised name, or a shortened id when the sensor does not advertise one
    pub fn name(&self) -> String {
        match &self.display_name {
            Some(name) => name.clone(),
            None => {
                let tail: String = self
                    .id
                    .chars()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect();
                format!("Sensor {}", tail)
            }
        }
    }
}

/// Platform Bluetooth permission as reported to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    #[default]
    Unknown,
    Denied,
    Authorized,
}

impl fmt::Display for PermissionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Denied => write!(f, "denied"),
            Self::Authorized => write!(f, "authorized"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Connected(Device),
    Disconnecting,
    Error(String),
}

impl ConnectionState {
    /// Short lowercase label used in logs and `status` responses
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scanning => "scanning",
            Self::Connecting => "connecting",
            Self::Connected(_) => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Error(_) => "error",
        }
    }

    pub fn connected_device(&self) -> Option<&Device> {
        match self {
            Self::Connected(device) => Some(device),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(device) => write!(f, "connected({})", device.id),
            Self::Error(reason) => write!(f, "error({})", reason),
            other => write!(f, "{}", other.label()),
        }
    }
}

/// One decoded Heart Rate Measurement notification
#[derive(Debug, Clone, PartialEq)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub timestamp_seconds: f64,
    pub rr_intervals_millis: Option<Vec<f64>>,
}

impl HeartRateSample {
    /// A BPM of 0 means the sensor has no skin contact or no reading yet
    pub fn is_reading(&self) -> bool {
        self.bpm > 0
    }
}

/// Seconds since the Unix epoch as a float, the timestamp format used on the wire
pub fn unix_timestamp() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_name_fallback() {
        let named = Device::new("AA:BB:CC:DD:EE:FF", Some("Polar H10".to_string()), -60);
        assert_eq!(named.name(), "Polar H10");

        let anonymous = Device::new("AA:BB:CC:DD:EE:FF", Some("  ".to_string()), -60);
        assert_eq!(anonymous.display_name, None);
        assert_eq!(anonymous.name(), "Sensor EE:FF");
    }

    #[test]
    fn test_permission_serializes_lowercase() {
        let json = serde_json::to_string(&PermissionState::Authorized).unwrap();
        assert_eq!(json, "\"authorized\"");
    }

    #[test]
    fn test_state_labels() {
        let device = Device::new("sim-hr-01", None, -50);
        assert_eq!(ConnectionState::Connected(device).label(), "connected");
        assert_eq!(ConnectionState::Error("x".into()).to_string(), "error(x)");
    }
}
