//! Bluetooth Service Module
//!
//! The btleplug-backed adapter. Owns the background tasks for discovery,
//! the connect/notify link and adapter power-state tracking.

use crate::domain::models::PermissionState;
use crate::infrastructure::bluetooth::{
    connection::{self, LinkConfig},
    emit, report_lost_events,
    scanner::BleScanner,
    AdapterError, AdapterEvent, BleAdapter, ConnectFailure, EventSender,
};
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _};
use btleplug::platform::{Adapter, Manager};
use futures::StreamExt;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pause before subscribing to adapter events again after losing them
const EVENT_RETRY_DELAY: Duration = Duration::from_secs(2);

pub struct PlatformAdapter {
    central: Adapter,
    event_sender: EventSender,
    runtime: Handle,
    config: LinkConfig,
    scanner: BleScanner,
    /// Connect attempt followed by notification forwarding for one device
    link: Option<(String, JoinHandle<()>)>,
    power_watch: JoinHandle<()>,
}

impl PlatformAdapter {
    /// Open the first adapter of the platform manager.
    /// Must be called from within the runtime that will drive it.
    pub async fn new(event_sender: EventSender, connect_timeout: std::time::Duration) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(AdapterError::Unavailable)?;

        match central.adapter_info().await {
            Ok(info) => info!("Using Bluetooth adapter {}", info),
            Err(e) => warn!("Adapter info unavailable: {}", e),
        }

        let runtime = Handle::current();
        let power_watch = runtime.spawn(watch_power_state(central.clone(), event_sender.clone()));

        Ok(Self {
            scanner: BleScanner::new(central.clone(), event_sender.clone(), runtime.clone()),
            central,
            event_sender,
            runtime,
            config: LinkConfig { connect_timeout },
            link: None,
            power_watch,
        })
    }

    fn abort_link(&mut self) {
        if let Some((device_id, task)) = self.link.take() {
            task.abort();
            info!(device_id = %device_id, "Link task cancelled");
        }
    }
}

impl BleAdapter for PlatformAdapter {
    fn name(&self) -> &'static str {
        "platform"
    }

    fn start_scan(&mut self, session: u64) -> Result<(), AdapterError> {
        self.scanner.start(session)
    }

    fn stop_scan(&mut self) {
        self.scanner.stop();
    }

    fn connect(&mut self, device_id: &str, attempt: u64) -> Result<(), AdapterError> {
        self.abort_link();

        let central = self.central.clone();
        let sender = self.event_sender.clone();
        let timeout = self.config.connect_timeout;
        let id = device_id.to_string();

        let task = self.runtime.spawn(async move {
            let outcome = tokio::time::timeout(timeout, connection::establish(&central, &id)).await;
            let peripheral = match outcome {
                Ok(Ok(peripheral)) => peripheral,
                Ok(Err(cause)) => {
                    warn!(device_id = %id, "Connect failed: {}", cause);
                    emit(&sender, AdapterEvent::ConnectFailed { attempt, cause });
                    return;
                }
                Err(_) => {
                    warn!(device_id = %id, "Connect timed out after {:?}", timeout);
                    if let Some(peripheral) = connection::find_peripheral(&central, &id).await {
                        connection::release(&peripheral, None).await;
                    }
                    emit(
                        &sender,
                        AdapterEvent::ConnectFailed {
                            attempt,
                            cause: ConnectFailure::Timeout,
                        },
                    );
                    return;
                }
            };

            emit(
                &sender,
                AdapterEvent::Connected {
                    attempt,
                    device_id: id.clone(),
                },
            );
            connection::forward_notifications(&central, &peripheral, &id, &sender).await;
            emit(&sender, AdapterEvent::Dropped { device_id: id });
        });

        self.link = Some((device_id.to_string(), task));
        Ok(())
    }

    fn disconnect(&mut self, device_id: &str) {
        self.abort_link();

        let central = self.central.clone();
        let sender = self.event_sender.clone();
        let id = device_id.to_string();
        self.runtime.spawn(async move {
            connection::teardown(&central, &id, &sender).await;
        });
    }

    fn reset(&mut self) {
        self.scanner.stop();
        self.abort_link();
    }

    fn shutdown(&mut self) {
        self.reset();
        self.power_watch.abort();
    }
}

impl Drop for PlatformAdapter {
    fn drop(&mut self) {
        self.power_watch.abort();
        self.abort_link();
    }
}

/// Powered-off or unauthorised radios show up as a denied permission
pub fn permission_for(state: CentralState) -> PermissionState {
    match state {
        CentralState::PoweredOn => PermissionState::Authorized,
        CentralState::PoweredOff => PermissionState::Denied,
        _ => PermissionState::Unknown,
    }
}

/// Report the current power state, then every change the stack signals.
///
/// Losing the event stream is reported once as fatal; the watch keeps
/// resubscribing and reports the state again once events flow.
async fn watch_power_state(central: Adapter, sender: EventSender) {
    let mut healthy = true;
    loop {
        match central.events().await {
            Ok(mut events) => {
                emit(
                    &sender,
                    AdapterEvent::PermissionChanged(current_permission(&central).await),
                );
                healthy = true;
                while let Some(event) = events.next().await {
                    if let CentralEvent::StateUpdate(state) = event {
                        info!("Adapter state changed: {:?}", state);
                        emit(&sender, AdapterEvent::PermissionChanged(permission_for(state)));
                    }
                }
            }
            Err(e) => warn!("Cannot watch adapter events: {}", e),
        }

        if healthy {
            report_lost_events(&sender, "power state tracking");
            healthy = false;
        }
        tokio::time::sleep(EVENT_RETRY_DELAY).await;
    }
}

async fn current_permission(central: &Adapter) -> PermissionState {
    match central.adapter_state().await {
        Ok(state) => permission_for(state),
        Err(btleplug::Error::PermissionDenied) => PermissionState::Denied,
        Err(e) => {
            warn!("Could not read adapter state: {}", e);
            PermissionState::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_state_mapping() {
        assert_eq!(permission_for(CentralState::PoweredOn), PermissionState::Authorized);
        assert_eq!(permission_for(CentralState::PoweredOff), PermissionState::Denied);
        assert_eq!(permission_for(CentralState::Unknown), PermissionState::Unknown);
    }
}
