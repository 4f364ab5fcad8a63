//! Bluetooth Module
//!
//! One capability interface over the BLE stack, with a platform variant
//! (btleplug) and a deterministic simulated variant. The variant is picked
//! once at startup from [`AdapterKind`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │              dyn BleAdapter (chosen at startup)          │
//! └───────────────┬───────────────────────────┬──────────────┘
//!                 │                           │
//!                 ▼                           ▼
//!       ┌──────────────────┐         ┌──────────────────┐
//!       │  PlatformAdapter │         │ SimulatedAdapter │
//!       │  scanner         │         │ fixed devices    │
//!       │  connection      │         │ scripted samples │
//!       └────────┬─────────┘         └────────┬─────────┘
//!                │      AdapterEvent          │
//!                └──────────┬─────────────────┘
//!                           ▼
//!              bridge ingress queue (BridgeEvent)
//! ```
//!
//! Adapter methods never block on the radio. They start the work and
//! return; completions arrive later as [`AdapterEvent`]s carrying the scan
//! session or connect attempt that produced them, so the bridge can drop
//! anything it has already moved past.
//!
//! ## Modules
//!
//! - [`protocol`] - Heart Rate service and characteristic identifiers
//! - [`scanner`] - advertisement filtering and per-session dedup
//! - [`connection`] - GATT resolution, subscription and teardown
//! - [`service`] - the btleplug-backed adapter
//! - [`simulated`] - synthetic sensors for hosts without a radio

pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;

use crate::bridge::BridgeEvent;
use crate::domain::models::{Device, PermissionState};
use crate::domain::settings::{AdapterKind, BridgeSettings};
use thiserror::Error;
use tokio::sync::mpsc;

pub use service::PlatformAdapter;
pub use simulated::{SampleSource, SimulatedAdapter, SimulationConfig};

/// Why a connect attempt ended without a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectFailure {
    DeviceNotFound,
    ServiceMissing,
    CharacteristicMissing,
    SubscribeRejected(String),
    Timeout,
    Platform(String),
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DeviceNotFound => write!(f, "device is no longer reachable"),
            Self::ServiceMissing => write!(f, "heart rate service 0x180D not found"),
            Self::CharacteristicMissing => {
                write!(f, "heart rate measurement characteristic 0x2A37 not found")
            }
            Self::SubscribeRejected(reason) => write!(f, "subscription rejected: {}", reason),
            Self::Timeout => write!(f, "connection timed out"),
            Self::Platform(reason) => write!(f, "{}", reason),
        }
    }
}

/// Completion or notification reported by an adapter
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    PermissionChanged(PermissionState),
    Discovered { session: u64, device: Device },
    ScanFailed { session: u64, error: String },
    Connected { attempt: u64, device_id: String },
    ConnectFailed { attempt: u64, cause: ConnectFailure },
    Notification { device_id: String, payload: Vec<u8> },
    /// The link went away without being asked to
    Dropped { device_id: String },
    /// A requested disconnect has finished releasing the device
    Released { device_id: String },
    /// The adapter itself is unusable
    Fatal(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("bluetooth permission denied")]
    PermissionDenied,

    #[error("no bluetooth adapter available")]
    Unavailable,

    #[error("{0}")]
    Platform(String),
}

/// Capability every BLE backend provides to the bridge
pub trait BleAdapter: Send {
    fn name(&self) -> &'static str;

    /// Begin discovery. Results are tagged with `session`.
    fn start_scan(&mut self, session: u64) -> Result<(), AdapterError>;

    /// Best effort; late results may still arrive and are filtered upstream
    fn stop_scan(&mut self);

    /// Begin connecting. Exactly one `Connected` or `ConnectFailed` tagged
    /// with `attempt` follows unless the attempt is cancelled by `disconnect`.
    fn connect(&mut self, device_id: &str, attempt: u64) -> Result<(), AdapterError>;

    /// Unsubscribe if possible and release the device, then report `Released`
    fn disconnect(&mut self, device_id: &str);

    /// Drop scan and link work after a fatal adapter error.
    /// State tracking keeps running so the adapter can be used again.
    fn reset(&mut self) {
        self.stop_scan();
    }

    /// Stop background work before the process exits
    fn shutdown(&mut self) {
        self.reset();
    }
}

/// Sender half handed to adapters
pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;

pub(crate) fn emit(tx: &EventSender, event: AdapterEvent) {
    // The bridge is gone during shutdown; nothing left to notify
    let _ = tx.send(BridgeEvent::Adapter(event));
}

/// The platform stopped delivering events; the bridge treats the adapter as failed
pub(crate) fn report_lost_events(tx: &EventSender, during: &str) {
    tracing::error!("Bluetooth event stream ended during {}", during);
    emit(
        tx,
        AdapterEvent::Fatal(format!("Bluetooth adapter stopped responding during {}", during)),
    );
}

/// Build the adapter selected in settings
pub async fn create_adapter(
    settings: &BridgeSettings,
    tx: EventSender,
) -> anyhow::Result<Box<dyn BleAdapter>> {
    match settings.adapter {
        AdapterKind::Simulated => {
            let config = SimulationConfig {
                notify_interval: std::time::Duration::from_millis(
                    settings.simulated_notify_interval_ms,
                ),
                ..SimulationConfig::default()
            };
            Ok(Box::new(SimulatedAdapter::new(tx, config)))
        }
        AdapterKind::Platform => {
            let adapter = PlatformAdapter::new(tx, settings.connect_timeout()).await?;
            Ok(Box::new(adapter))
        }
    }
}
