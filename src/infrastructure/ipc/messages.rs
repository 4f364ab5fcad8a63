//! Wire vocabulary exchanged between the bridge and its client.
//!
//! Every payload is a JSON object whose `type` field selects the variant.
//! Client and bridge directions are separate enums because both use a
//! `status` message with different shapes.

use crate::domain::models::{Device, PermissionState};
use serde::{Deserialize, Serialize};

/// Version announced in `ready` and expected in `handshake`
pub const PROTOCOL_VERSION: u32 = 1;

/// Client → bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Handshake {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client: Option<String>,
    },
    Scan {
        on: bool,
    },
    Connect {
        id: String,
    },
    Disconnect,
    Status,
}

/// Bridge → client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Ready {
        version: u32,
    },
    Permission {
        state: PermissionState,
    },
    DeviceFound {
        device: DeviceInfo,
    },
    Connected {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    Disconnected {
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    HrData {
        bpm: u16,
        timestamp: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rr: Option<Vec<f64>>,
    },
    Status {
        permission: PermissionState,
        connected: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
        #[serde(default)]
        state: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    BridgeHeartbeat {
        timestamp: f64,
    },
}

impl BridgeMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Short name for logging without dumping the payload
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Permission { .. } => "permission",
            Self::DeviceFound { .. } => "device_found",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::HrData { .. } => "hr_data",
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
            Self::BridgeHeartbeat { .. } => "bridge_heartbeat",
        }
    }
}

/// Device as it appears in `device_found`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub rssi: i16,
}

impl From<&Device> for DeviceInfo {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name(),
            rssi: device.signal_strength,
        }
    }
}

/// Closed set of fault codes carried by `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DeviceNotFound,
    Busy,
    NotConnected,
    ServiceNotFound,
    CharacteristicNotFound,
    SubscribeFailed,
    ConnectTimeout,
    ConnectFailed,
    PermissionDenied,
    ScanFailed,
    AdapterFailure,
    InvalidMessage,
}
