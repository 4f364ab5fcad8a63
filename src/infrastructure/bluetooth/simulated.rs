//! Simulated Adapter
//!
//! Deterministic stand-in for hosts without a usable radio. Advertises a
//! fixed device list and streams synthetic Heart Rate Measurement payloads
//! through the same event path as real hardware.

use crate::domain::heart_rate::{FLAG_BPM_U16, FLAG_RR_INTERVALS};
use crate::domain::models::{Device, PermissionState};
use crate::infrastructure::bluetooth::{
    emit, AdapterError, AdapterEvent, BleAdapter, ConnectFailure, EventSender,
};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub const PRIMARY_DEVICE_ID: &str = "sim-hr-01";
pub const SECONDARY_DEVICE_ID: &str = "sim-hr-02";

/// What the simulated sensor sends once connected
#[derive(Debug, Clone)]
pub enum SampleSource {
    /// Endless gentle oscillation around 72 BPM with RR intervals
    Waveform,
    /// Exactly these raw payloads, one per interval, then silence
    Script(Vec<Vec<u8>>),
}

impl SampleSource {
    /// Script of plain 8-bit BPM payloads
    pub fn bpm_script(values: &[u8]) -> Self {
        Self::Script(values.iter().map(|bpm| vec![0x00, *bpm]).collect())
    }
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub devices: Vec<Device>,
    pub permission: PermissionState,
    pub discovery_delay: Duration,
    pub connect_delay: Duration,
    pub notify_interval: Duration,
    pub samples: SampleSource,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            permission: PermissionState::Authorized,
            discovery_delay: Duration::from_millis(150),
            connect_delay: Duration::from_millis(300),
            notify_interval: Duration::from_secs(1),
            samples: SampleSource::Waveform,
        }
    }
}

pub fn default_devices() -> Vec<Device> {
    vec![
        Device::new(
            PRIMARY_DEVICE_ID,
            Some("HeartSync Simulator".to_string()),
            -58,
        ),
        Device::new(SECONDARY_DEVICE_ID, None, -71),
    ]
}

/// Payload for the `tick`-th waveform sample
pub fn waveform_payload(tick: u64) -> Vec<u8> {
    let phase = tick as f64 / 10.0;
    let bpm = (72.0 + 8.0 * phase.sin()).round() as u16;
    let rr = (60_000.0 / bpm as f64 * 1024.0 / 1000.0).round() as u16;

    let mut payload = vec![FLAG_BPM_U16 | FLAG_RR_INTERVALS];
    payload.extend_from_slice(&bpm.to_le_bytes());
    payload.extend_from_slice(&rr.to_le_bytes());
    payload
}

pub struct SimulatedAdapter {
    event_sender: EventSender,
    config: SimulationConfig,
    runtime: Handle,
    scan_task: Option<JoinHandle<()>>,
    link: Option<JoinHandle<()>>,
}

impl SimulatedAdapter {
    /// Must be called from within a tokio runtime
    pub fn new(event_sender: EventSender, config: SimulationConfig) -> Self {
        info!(
            devices = config.devices.len(),
            "Using simulated Bluetooth adapter"
        );
        emit(&event_sender, AdapterEvent::PermissionChanged(config.permission));
        Self {
            event_sender,
            config,
            runtime: Handle::current(),
            scan_task: None,
            link: None,
        }
    }

    fn knows(&self, device_id: &str) -> bool {
        self.config.devices.iter().any(|d| d.id == device_id)
    }
}

impl BleAdapter for SimulatedAdapter {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn start_scan(&mut self, session: u64) -> Result<(), AdapterError> {
        if self.config.permission == PermissionState::Denied {
            return Err(AdapterError::PermissionDenied);
        }
        self.stop_scan();

        let sender = self.event_sender.clone();
        let devices = self.config.devices.clone();
        let delay = self.config.discovery_delay;
        self.scan_task = Some(self.runtime.spawn(async move {
            for device in devices {
                tokio::time::sleep(delay).await;
                debug!(session, id = %device.id, "Simulated advertisement");
                emit(&sender, AdapterEvent::Discovered { session, device });
            }
        }));
        Ok(())
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }

    fn connect(&mut self, device_id: &str, attempt: u64) -> Result<(), AdapterError> {
        if self.config.permission == PermissionState::Denied {
            return Err(AdapterError::PermissionDenied);
        }
        if let Some(task) = self.link.take() {
            task.abort();
        }

        let sender = self.event_sender.clone();
        let known = self.knows(device_id);
        let id = device_id.to_string();
        let connect_delay = self.config.connect_delay;
        let interval = self.config.notify_interval;
        let samples = self.config.samples.clone();

        self.link = Some(self.runtime.spawn(async move {
            tokio::time::sleep(connect_delay).await;
            if !known {
                emit(
                    &sender,
                    AdapterEvent::ConnectFailed {
                        attempt,
                        cause: ConnectFailure::DeviceNotFound,
                    },
                );
                return;
            }
            emit(
                &sender,
                AdapterEvent::Connected {
                    attempt,
                    device_id: id.clone(),
                },
            );

            let notify = |payload: Vec<u8>| {
                emit(
                    &sender,
                    AdapterEvent::Notification {
                        device_id: id.clone(),
                        payload,
                    },
                );
            };
            match samples {
                SampleSource::Script(payloads) => {
                    for payload in payloads {
                        tokio::time::sleep(interval).await;
                        notify(payload);
                    }
                }
                SampleSource::Waveform => {
                    let mut tick = 0u64;
                    loop {
                        tokio::time::sleep(interval).await;
                        notify(waveform_payload(tick));
                        tick += 1;
                    }
                }
            }
        }));
        Ok(())
    }

    fn disconnect(&mut self, device_id: &str) {
        if let Some(task) = self.link.take() {
            task.abort();
        }
        info!(device_id, "Simulated device released");
        emit(
            &self.event_sender,
            AdapterEvent::Released {
                device_id: device_id.to_string(),
            },
        );
    }

    fn reset(&mut self) {
        self.stop_scan();
        if let Some(task) = self.link.take() {
            task.abort();
        }
    }
}

impl Drop for SimulatedAdapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
