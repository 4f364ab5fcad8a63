//! Client Side
//!
//! What a consumer process (the plugin, or `heartsync-monitor`) needs to
//! talk to the bridge: a reconnecting socket client with heartbeat
//! supervision, and a monitor that turns bridge events into the state a
//! presentation layer may read.

pub mod backoff;
pub mod connection;
pub mod monitor;

pub use backoff::ReconnectPolicy;
pub use connection::{BridgeClient, ClientConfig, ClientError, ClientEvent};
pub use monitor::{HeartRateMonitor, MonitorSnapshot};
