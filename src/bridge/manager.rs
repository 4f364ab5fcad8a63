//! Connection Manager
//!
//! Owns the one sensor connection and the scan result set. Client commands
//! and adapter completions are applied here in queue order; outbound
//! messages are appended to a caller-provided buffer.
//!
//! ```text
//! Idle ──scan on──▶ Scanning ──scan off──▶ Idle
//! Idle | Scanning ──connect(id)──▶ Connecting ──subscribed──▶ Connected
//! Connecting ──failure──▶ Error ──▶ Idle
//! Connecting | Connected ──disconnect | drop──▶ Disconnecting ──▶ Idle
//! any ──fatal adapter error──▶ Error ──▶ Idle
//! ```
//!
//! Adapter results carry the scan session or connect attempt they belong
//! to. Anything tagged with an old session or attempt is discarded.

use crate::domain::heart_rate;
use crate::domain::models::{unix_timestamp, ConnectionState, Device, PermissionState};
use crate::infrastructure::bluetooth::{AdapterError, AdapterEvent, BleAdapter, ConnectFailure};
use crate::infrastructure::ipc::{BridgeMessage, ClientMessage, DeviceInfo, ErrorCode, PROTOCOL_VERSION};
use std::collections::HashMap;
use tracing::{debug, error, info, trace, warn};

pub const REASON_REQUESTED: &str = "requested";
pub const REASON_CANCELLED: &str = "cancelled";
pub const REASON_DROPPED: &str = "peripheral_dropped";
pub const REASON_SHUTDOWN: &str = "shutdown";
pub const REASON_ADAPTER_FAILURE: &str = "adapter_failure";

pub struct ConnectionManager {
    adapter: Box<dyn BleAdapter>,
    state: ConnectionState,
    permission: PermissionState,
    results: HashMap<String, Device>,
    scan_session: u64,
    attempt: u64,
    /// Device being connected to, or being released
    target: Option<Device>,
    release_reason: &'static str,
}

impl ConnectionManager {
    pub fn new(adapter: Box<dyn BleAdapter>) -> Self {
        info!(adapter = adapter.name(), "Connection manager ready");
        Self {
            adapter,
            state: ConnectionState::Idle,
            permission: PermissionState::Unknown,
            results: HashMap::new(),
            scan_session: 0,
            attempt: 0,
            target: None,
            release_reason: REASON_REQUESTED,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn permission(&self) -> PermissionState {
        self.permission
    }

    pub fn is_idle(&self) -> bool {
        self.state == ConnectionState::Idle
    }

    /// Devices seen in the current scan session
    pub fn scan_results(&self) -> impl Iterator<Item = &Device> {
        self.results.values()
    }

    /// Messages sent to every newly attached client
    pub fn greeting(&self) -> Vec<BridgeMessage> {
        vec![
            BridgeMessage::Ready {
                version: PROTOCOL_VERSION,
            },
            BridgeMessage::Permission {
                state: self.permission,
            },
        ]
    }

    pub fn status(&self) -> BridgeMessage {
        let device = self.state.connected_device();
        BridgeMessage::Status {
            permission: self.permission,
            connected: device.is_some(),
            device_id: device.map(|d| d.id.clone()),
            state: self.state.label().to_string(),
        }
    }

    /// Apply one client command
    pub fn handle_client(&mut self, message: ClientMessage, out: &mut Vec<BridgeMessage>) {
        match message {
            ClientMessage::Handshake { version, client } => {
                info!(
                    client = client.as_deref().unwrap_or("unnamed"),
                    version = ?version,
                    "Client handshake"
                );
                if let Some(v) = version.filter(|v| *v != PROTOCOL_VERSION) {
                    warn!(
                        "Client speaks protocol {}, bridge speaks {}",
                        v, PROTOCOL_VERSION
                    );
                }
                out.extend(self.greeting());
            }
            ClientMessage::Scan { on: true } => self.start_scan(out),
            ClientMessage::Scan { on: false } => self.stop_scan(),
            ClientMessage::Connect { id } => self.connect(&id, out),
            ClientMessage::Disconnect => self.disconnect(REASON_REQUESTED, out),
            ClientMessage::Status => out.push(self.status()),
        }
    }

    fn start_scan(&mut self, out: &mut Vec<BridgeMessage>) {
        if self.permission == PermissionState::Denied {
            out.push(permission_error());
            return;
        }
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Scanning) {
            out.push(BridgeMessage::error(
                ErrorCode::Busy,
                format!("cannot scan while {}", self.state.label()),
            ));
            return;
        }

        self.scan_session += 1;
        self.results.clear();
        match self.adapter.start_scan(self.scan_session) {
            Ok(()) => {
                info!(session = self.scan_session, "Scan started");
                self.transition(ConnectionState::Scanning);
            }
            Err(e) => {
                self.transition(ConnectionState::Idle);
                self.report_adapter_error(e, ErrorCode::ScanFailed, out);
            }
        }
    }

    fn stop_scan(&mut self) {
        if self.state != ConnectionState::Scanning {
            debug!("Scan stop requested while {}", self.state);
            return;
        }
        self.adapter.stop_scan();
        // Late advertisements from the old session are now stale
        self.scan_session += 1;
        info!("Scan stopped");
        self.transition(ConnectionState::Idle);
    }

    fn connect(&mut self, id: &str, out: &mut Vec<BridgeMessage>) {
        if self.permission == PermissionState::Denied {
            out.push(permission_error());
            return;
        }
        if !matches!(self.state, ConnectionState::Idle | ConnectionState::Scanning) {
            warn!(device_id = id, "Connect rejected while {}", self.state);
            out.push(BridgeMessage::error(
                ErrorCode::Busy,
                format!("cannot connect while {}", self.state.label()),
            ));
            return;
        }
        let Some(device) = self.results.get(id).cloned() else {
            out.push(BridgeMessage::error(
                ErrorCode::DeviceNotFound,
                format!("device {} is not in the current scan results", id),
            ));
            return;
        };

        if self.state == ConnectionState::Scanning {
            self.adapter.stop_scan();
            self.scan_session += 1;
        }

        self.attempt += 1;
        match self.adapter.connect(id, self.attempt) {
            Ok(()) => {
                info!(device_id = id, attempt = self.attempt, "Connecting");
                self.target = Some(device);
                self.transition(ConnectionState::Connecting);
            }
            Err(e) => {
                self.transition(ConnectionState::Idle);
                self.report_adapter_error(e, ErrorCode::ConnectFailed, out);
            }
        }
    }

    fn disconnect(&mut self, reason: &'static str, out: &mut Vec<BridgeMessage>) {
        let device_id = match &self.state {
            ConnectionState::Connected(device) => device.id.clone(),
            ConnectionState::Connecting => match &self.target {
                Some(device) => device.id.clone(),
                None => return,
            },
            ConnectionState::Disconnecting => {
                debug!("Disconnect already in progress");
                return;
            }
            _ => {
                out.push(BridgeMessage::error(
                    ErrorCode::NotConnected,
                    "no active connection",
                ));
                return;
            }
        };

        let reason = if self.state == ConnectionState::Connecting && reason == REASON_REQUESTED {
            REASON_CANCELLED
        } else {
            reason
        };
        if let ConnectionState::Connected(device) = &self.state {
            self.target = Some(device.clone());
        }

        // Any completion for the running attempt is now stale
        self.attempt += 1;
        self.release_reason = reason;
        info!(device_id = %device_id, reason, "Disconnecting");
        self.transition(ConnectionState::Disconnecting);
        self.adapter.disconnect(&device_id);
    }

    /// Apply one adapter completion
    pub fn handle_adapter(&mut self, event: AdapterEvent, out: &mut Vec<BridgeMessage>) {
        match event {
            AdapterEvent::PermissionChanged(state) => self.permission_changed(state, out),
            AdapterEvent::Discovered { session, device } => {
                if session != self.scan_session || self.state != ConnectionState::Scanning {
                    trace!(session, id = %device.id, "Discarding stale discovery");
                    return;
                }
                out.push(BridgeMessage::DeviceFound {
                    device: DeviceInfo::from(&device),
                });
                self.results.insert(device.id.clone(), device);
            }
            AdapterEvent::ScanFailed { session, error } => {
                if session != self.scan_session || self.state != ConnectionState::Scanning {
                    debug!(session, "Discarding stale scan failure");
                    return;
                }
                error!("Scan failed: {}", error);
                self.transition(ConnectionState::Idle);
                out.push(BridgeMessage::error(ErrorCode::ScanFailed, error));
            }
            AdapterEvent::Connected { attempt, device_id } => {
                if attempt != self.attempt || self.state != ConnectionState::Connecting {
                    debug!(attempt, device_id = %device_id, "Discarding stale connect completion");
                    return;
                }
                let device = self
                    .target
                    .take()
                    .unwrap_or_else(|| Device::new(device_id.clone(), None, 0));
                info!(device_id = %device.id, name = %device.name(), "Connected");
                out.push(BridgeMessage::Connected {
                    device_id: device.id.clone(),
                    name: Some(device.name()),
                });
                self.transition(ConnectionState::Connected(device));
            }
            AdapterEvent::ConnectFailed { attempt, cause } => {
                if attempt != self.attempt || self.state != ConnectionState::Connecting {
                    debug!(attempt, "Discarding stale connect failure");
                    return;
                }
                warn!("Connect failed: {}", cause);
                self.target = None;
                self.transition(ConnectionState::Error(cause.to_string()));
                out.push(BridgeMessage::error(failure_code(&cause), cause.to_string()));
                self.transition(ConnectionState::Idle);
            }
            AdapterEvent::Notification { device_id, payload } => {
                self.forward_measurement(&device_id, &payload, out);
            }
            AdapterEvent::Dropped { device_id } => {
                let is_current = self
                    .state
                    .connected_device()
                    .is_some_and(|d| d.id == device_id);
                if !is_current {
                    debug!(device_id = %device_id, "Ignoring drop of inactive device");
                    return;
                }
                warn!(device_id = %device_id, "Peripheral dropped");
                self.attempt += 1;
                self.transition(ConnectionState::Disconnecting);
                out.push(BridgeMessage::Disconnected {
                    device_id,
                    reason: Some(REASON_DROPPED.to_string()),
                });
                self.transition(ConnectionState::Idle);
            }
            AdapterEvent::Released { device_id } => {
                let expected = self.target.as_ref().is_some_and(|d| d.id == device_id);
                if self.state != ConnectionState::Disconnecting || !expected {
                    debug!(device_id = %device_id, "Ignoring release of inactive device");
                    return;
                }
                self.target = None;
                out.push(BridgeMessage::Disconnected {
                    device_id,
                    reason: Some(self.release_reason.to_string()),
                });
                self.transition(ConnectionState::Idle);
            }
            AdapterEvent::Fatal(reason) => self.fatal(reason, out),
        }
    }

    fn permission_changed(&mut self, state: PermissionState, out: &mut Vec<BridgeMessage>) {
        if state == self.permission {
            return;
        }
        info!("Bluetooth permission: {} -> {}", self.permission, state);
        self.permission = state;
        out.push(BridgeMessage::Permission { state });

        if state == PermissionState::Denied && self.state == ConnectionState::Scanning {
            self.stop_scan();
        }
    }

    fn forward_measurement(&mut self, device_id: &str, payload: &[u8], out: &mut Vec<BridgeMessage>) {
        let is_current = self
            .state
            .connected_device()
            .is_some_and(|d| d.id == device_id);
        if !is_current {
            trace!(device_id, "Notification from inactive device");
            return;
        }

        match heart_rate::decode(payload, unix_timestamp()) {
            Ok(sample) if sample.is_reading() => {
                trace!(bpm = sample.bpm, "Heart rate sample");
                out.push(BridgeMessage::HrData {
                    bpm: sample.bpm,
                    timestamp: sample.timestamp_seconds,
                    rr: sample.rr_intervals_millis.filter(|rr| !rr.is_empty()),
                });
            }
            Ok(_) => trace!("No skin contact, sample dropped"),
            Err(e) => warn!(device_id, "Dropping measurement: {}", e),
        }
    }

    fn fatal(&mut self, reason: String, out: &mut Vec<BridgeMessage>) {
        error!("Adapter failure: {}", reason);
        let lost = self
            .state
            .connected_device()
            .map(|d| d.id.clone())
            .or_else(|| match self.state {
                ConnectionState::Connecting | ConnectionState::Disconnecting => {
                    self.target.as_ref().map(|d| d.id.clone())
                }
                _ => None,
            });

        self.scan_session += 1;
        self.attempt += 1;
        self.results.clear();
        self.target = None;
        self.adapter.reset();

        self.transition(ConnectionState::Error(reason.clone()));
        out.push(BridgeMessage::error(ErrorCode::AdapterFailure, reason));
        if let Some(device_id) = lost {
            out.push(BridgeMessage::Disconnected {
                device_id,
                reason: Some(REASON_ADAPTER_FAILURE.to_string()),
            });
        }
        self.transition(ConnectionState::Idle);
    }

    /// Stop scanning and start releasing any device.
    /// Returns true when a release is pending and the caller should keep
    /// draining adapter events until [`Self::is_idle`].
    pub fn begin_shutdown(&mut self, out: &mut Vec<BridgeMessage>) -> bool {
        match self.state {
            ConnectionState::Scanning => {
                self.stop_scan();
                false
            }
            ConnectionState::Connecting | ConnectionState::Connected(_) => {
                self.disconnect(REASON_SHUTDOWN, out);
                true
            }
            ConnectionState::Disconnecting => true,
            _ => false,
        }
    }

    /// Release background adapter work; last call before exit
    pub fn finish_shutdown(&mut self) {
        self.adapter.shutdown();
    }

    fn report_adapter_error(&mut self, error: AdapterError, code: ErrorCode, out: &mut Vec<BridgeMessage>) {
        match error {
            AdapterError::PermissionDenied => {
                if self.permission != PermissionState::Denied {
                    self.permission = PermissionState::Denied;
                    out.push(BridgeMessage::Permission {
                        state: PermissionState::Denied,
                    });
                }
                out.push(permission_error());
            }
            other => {
                warn!("Adapter refused request: {}", other);
                out.push(BridgeMessage::error(code, other.to_string()));
            }
        }
    }

    fn transition(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!("State {} -> {}", self.state, next);
            self.state = next;
        }
    }
}

fn permission_error() -> BridgeMessage {
    BridgeMessage::error(ErrorCode::PermissionDenied, "Bluetooth permission denied")
}

/// Wire code for a failed connect attempt
pub fn failure_code(cause: &ConnectFailure) -> ErrorCode {
    match cause {
        ConnectFailure::DeviceNotFound => ErrorCode::DeviceNotFound,
        ConnectFailure::ServiceMissing => ErrorCode::ServiceNotFound,
        ConnectFailure::CharacteristicMissing => ErrorCode::CharacteristicNotFound,
        ConnectFailure::SubscribeRejected(_) => ErrorCode::SubscribeFailed,
        ConnectFailure::Timeout => ErrorCode::ConnectTimeout,
        ConnectFailure::Platform(_) => ErrorCode::ConnectFailed,
    }
}
