//! HeartSync bridge
//!
//! Headless process that owns the BLE link to a heart-rate sensor and relays
//! decoded measurements to a single local client over a length-prefixed JSON
//! socket protocol.

pub mod bridge;
pub mod client;
pub mod domain;
pub mod infrastructure;
