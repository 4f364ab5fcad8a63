//! Heart Rate Monitor
//!
//! Folds bridge events into a [`MonitorSnapshot`] and runs every reading
//! through the [`SignalProcessor`]. The snapshot is all a presentation
//! layer gets to see.

use crate::client::connection::ClientEvent;
use crate::domain::models::PermissionState;
use crate::domain::signal::{SignalOutput, SignalProcessor};
use crate::infrastructure::ipc::{BridgeMessage, DeviceInfo, ErrorCode};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSnapshot {
    pub link_up: bool,
    pub permission: PermissionState,
    /// Bridge connection state label
    pub state: String,
    pub connected_device: Option<String>,
    pub devices: Vec<DeviceInfo>,
    pub last_bpm: Option<u16>,
    pub rr_intervals: Option<Vec<f64>>,
    pub output: Option<SignalOutput>,
    pub last_error: Option<(ErrorCode, String)>,
}

pub struct HeartRateMonitor {
    processor: SignalProcessor,
    snapshot: MonitorSnapshot,
}

impl HeartRateMonitor {
    pub fn new(processor: SignalProcessor) -> Self {
        Self {
            processor,
            snapshot: MonitorSnapshot {
                state: "unknown".to_string(),
                ..MonitorSnapshot::default()
            },
        }
    }

    pub fn snapshot(&self) -> &MonitorSnapshot {
        &self.snapshot
    }

    /// Adjust smoothing, offsets or the control source
    pub fn processor_mut(&mut self) -> &mut SignalProcessor {
        &mut self.processor
    }

    /// Apply one event; returns the processed output for readings
    pub fn apply(&mut self, event: &ClientEvent) -> Option<SignalOutput> {
        match event {
            ClientEvent::LinkUp => {
                self.snapshot.link_up = true;
                None
            }
            ClientEvent::LinkDown { .. } => {
                self.snapshot.link_up = false;
                self.snapshot.state = "unknown".to_string();
                self.snapshot.connected_device = None;
                self.snapshot.devices.clear();
                self.processor.reset();
                None
            }
            ClientEvent::Message(message) => self.apply_message(message),
        }
    }

    fn apply_message(&mut self, message: &BridgeMessage) -> Option<SignalOutput> {
        let snapshot = &mut self.snapshot;
        match message {
            BridgeMessage::Permission { state } => snapshot.permission = *state,
            BridgeMessage::DeviceFound { device } => {
                match snapshot.devices.iter_mut().find(|d| d.id == device.id) {
                    Some(existing) => *existing = device.clone(),
                    None => snapshot.devices.push(device.clone()),
                }
            }
            BridgeMessage::Connected { device_id, .. } => {
                snapshot.connected_device = Some(device_id.clone());
                snapshot.state = "connected".to_string();
                self.processor.reset();
            }
            BridgeMessage::Disconnected { .. } => {
                snapshot.connected_device = None;
                snapshot.state = "idle".to_string();
                snapshot.last_bpm = None;
                snapshot.rr_intervals = None;
            }
            BridgeMessage::Status {
                permission,
                device_id,
                state,
                ..
            } => {
                snapshot.permission = *permission;
                snapshot.connected_device = device_id.clone();
                snapshot.state = state.clone();
            }
            BridgeMessage::HrData { bpm, rr, .. } => {
                let output = self.processor.push(*bpm as f64);
                snapshot.last_bpm = Some(*bpm);
                snapshot.rr_intervals = rr.clone();
                snapshot.output = Some(output);
                return Some(output);
            }
            BridgeMessage::Error { code, message } => {
                snapshot.last_error = Some((*code, message.clone()));
            }
            BridgeMessage::Ready { .. } | BridgeMessage::BridgeHeartbeat { .. } => {}
        }
        None
    }
}
