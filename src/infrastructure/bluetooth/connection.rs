//! BLE Connection Module
//!
//! Resolves the Heart Rate service on a peripheral, subscribes to
//! measurements, forwards notifications and tears the link down again.

use crate::infrastructure::bluetooth::{
    emit, protocol, scanner, AdapterEvent, ConnectFailure, EventSender,
};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Peripheral as _};
use btleplug::platform::{Adapter, Peripheral};
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Upper bound for connect + discovery + subscribe
    pub connect_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Find a peripheral the stack has seen by its reported id
pub async fn find_peripheral(central: &Adapter, device_id: &str) -> Option<Peripheral> {
    let peripherals = central.peripherals().await.ok()?;
    peripherals
        .into_iter()
        .find(|p| scanner::device_id(p) == device_id)
}

/// Connect, resolve 0x180D / 0x2A37 and subscribe.
///
/// On any failure after the radio link is up, the link is released again
/// before the cause is returned.
pub async fn establish(central: &Adapter, device_id: &str) -> Result<Peripheral, ConnectFailure> {
    let peripheral = find_peripheral(central, device_id)
        .await
        .ok_or(ConnectFailure::DeviceNotFound)?;

    // Step 1: Radio link
    info!(device_id, "Connecting...");
    peripheral
        .connect()
        .await
        .map_err(|e| ConnectFailure::Platform(e.to_string()))?;

    // Step 2: Service and characteristic
    let characteristic = match resolve_measurement(&peripheral).await {
        Ok(characteristic) => characteristic,
        Err(cause) => {
            release(&peripheral, None).await;
            return Err(cause);
        }
    };

    // Step 3: Notifications
    if let Err(e) = peripheral.subscribe(&characteristic).await {
        release(&peripheral, None).await;
        return Err(ConnectFailure::SubscribeRejected(e.to_string()));
    }

    info!(device_id, "Subscribed to heart rate measurements");
    Ok(peripheral)
}

async fn resolve_measurement(peripheral: &Peripheral) -> Result<Characteristic, ConnectFailure> {
    peripheral
        .discover_services()
        .await
        .map_err(|e| ConnectFailure::Platform(e.to_string()))?;

    let service = peripheral
        .services()
        .into_iter()
        .find(|s| s.uuid == protocol::HEART_RATE_SERVICE)
        .ok_or(ConnectFailure::ServiceMissing)?;
    debug!("Found heart rate service");

    let characteristic = service
        .characteristics
        .into_iter()
        .find(|c| c.uuid == protocol::HEART_RATE_MEASUREMENT)
        .ok_or(ConnectFailure::CharacteristicMissing)?;

    if !characteristic.properties.contains(CharPropFlags::NOTIFY) {
        return Err(ConnectFailure::SubscribeRejected(
            "measurement characteristic does not support notify".to_string(),
        ));
    }
    Ok(characteristic)
}

/// Forward measurement notifications until the link goes away
pub async fn forward_notifications(
    central: &Adapter,
    peripheral: &Peripheral,
    device_id: &str,
    sender: &EventSender,
) {
    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(device_id, "Could not open notification stream: {}", e);
            return;
        }
    };
    let mut events = match central.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(device_id, "Could not watch adapter events: {}", e);
            return;
        }
    };
    let peripheral_id = peripheral.id();

    loop {
        tokio::select! {
            notification = notifications.next() => match notification {
                Some(n) if n.uuid == protocol::HEART_RATE_MEASUREMENT => {
                    emit(sender, AdapterEvent::Notification {
                        device_id: device_id.to_string(),
                        payload: n.value,
                    });
                }
                Some(_) => {}
                None => {
                    debug!(device_id, "Notification stream closed");
                    break;
                }
            },
            event = events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                    info!(device_id, "Peripheral disconnected");
                    break;
                }
                Some(_) => {}
                None => break,
            },
        }
    }
}

/// Unsubscribe if the peripheral is still reachable, then disconnect.
/// Failures are logged and never abort the teardown.
pub async fn release(peripheral: &Peripheral, characteristic: Option<&Characteristic>) {
    let connected = peripheral.is_connected().await.unwrap_or(false);
    if !connected {
        debug!("Peripheral already gone, nothing to release");
        return;
    }

    if let Some(characteristic) = characteristic {
        if let Err(e) = peripheral.unsubscribe(characteristic).await {
            warn!("Unsubscribe failed, continuing teardown: {}", e);
        }
    }
    if let Err(e) = peripheral.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
}

/// Tear down whatever link exists to `device_id` and report `Released`
pub async fn teardown(central: &Adapter, device_id: &str, sender: &EventSender) {
    if let Some(peripheral) = find_peripheral(central, device_id).await {
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == protocol::HEART_RATE_MEASUREMENT);
        release(&peripheral, characteristic.as_ref()).await;
    }
    info!(device_id, "Device released");
    emit(
        sender,
        AdapterEvent::Released {
            device_id: device_id.to_string(),
        },
    );
}
