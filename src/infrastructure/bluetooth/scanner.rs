//! BLE Scanner Module
//!
//! Discovers peripherals advertising the Heart Rate service and reports
//! each one once per scan session.

use crate::domain::models::Device;
use crate::infrastructure::bluetooth::{
    emit, protocol, report_lost_events, AdapterError, AdapterEvent, EventSender,
};
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::collections::HashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Used when the stack reports no RSSI for an advertisement
pub const UNKNOWN_RSSI: i16 = -127;

/// Devices already reported in the current session.
///
/// A device is reported again only when it starts advertising a name it
/// did not have at first sighting.
#[derive(Debug, Default)]
pub(crate) struct DiscoverySet {
    seen: HashMap<String, bool>,
}

impl DiscoverySet {
    /// Record a sighting; returns true when it should be reported
    pub fn observe(&mut self, device: &Device) -> bool {
        let named = device.display_name.is_some();
        match self.seen.insert(device.id.clone(), named) {
            None => true,
            Some(was_named) => {
                if was_named && !named {
                    // Keep the better record
                    self.seen.insert(device.id.clone(), true);
                }
                !was_named && named
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }
}

/// Stable identifier reported to clients
pub fn device_id(peripheral: &Peripheral) -> String {
    peripheral.id().to_string()
}

/// BLE Scanner for heart-rate sensors
pub struct BleScanner {
    central: Adapter,
    event_sender: EventSender,
    runtime: Handle,
    task: Option<JoinHandle<()>>,
}

impl BleScanner {
    pub fn new(central: Adapter, event_sender: EventSender, runtime: Handle) -> Self {
        Self {
            central,
            event_sender,
            runtime,
            task: None,
        }
    }

    /// Start a discovery session, replacing any running one
    pub fn start(&mut self, session: u64) -> Result<(), AdapterError> {
        self.abort_task();

        info!(session, "Starting BLE scan for heart rate service");
        let central = self.central.clone();
        let sender = self.event_sender.clone();
        self.task = Some(
            self.runtime
                .spawn(async move { run_discovery(central, session, sender).await }),
        );
        Ok(())
    }

    /// Stop scanning
    pub fn stop(&mut self) {
        if self.abort_task() {
            info!("Stopping BLE scan...");
            let central = self.central.clone();
            self.runtime.spawn(async move {
                if let Err(e) = central.stop_scan().await {
                    warn!("stop_scan failed: {}", e);
                }
            });
        }
    }

    fn abort_task(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        self.abort_task();
    }
}

async fn run_discovery(central: Adapter, session: u64, sender: EventSender) {
    let mut events = match central.events().await {
        Ok(events) => events,
        Err(e) => {
            report_scan_error(&sender, session, e);
            return;
        }
    };

    let filter = ScanFilter {
        services: vec![protocol::HEART_RATE_SERVICE],
    };
    if let Err(e) = central.start_scan(filter).await {
        report_scan_error(&sender, session, e);
        return;
    }

    let mut seen = DiscoverySet::default();
    while let Some(event) = events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ServicesAdvertisement { id, .. } => id,
            _ => continue,
        };

        let Ok(peripheral) = central.peripheral(&id).await else {
            continue;
        };
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        if !protocol::advertises_heart_rate(&props.services) {
            continue;
        }

        let device = Device::new(
            device_id(&peripheral),
            props.local_name,
            props.rssi.unwrap_or(UNKNOWN_RSSI),
        );
        if seen.observe(&device) {
            debug!(session, id = %device.id, name = %device.name(), "Heart rate sensor found");
            emit(&sender, AdapterEvent::Discovered { session, device });
        }
    }
    // Reaching here means the stream closed under us; stop() aborts the task instead
    debug!(session, found = seen.len(), "Discovery stream closed");
    report_lost_events(&sender, "scan");
}

fn report_scan_error(sender: &EventSender, session: u64, error: btleplug::Error) {
    warn!(session, "Scan failed: {}", error);
    if matches!(error, btleplug::Error::PermissionDenied) {
        emit(
            sender,
            AdapterEvent::PermissionChanged(crate::domain::models::PermissionState::Denied),
        );
    }
    emit(
        sender,
        AdapterEvent::ScanFailed {
            session,
            error: error.to_string(),
        },
    );
}
