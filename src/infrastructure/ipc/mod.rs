//! Local IPC Module
//!
//! Everything the bridge and its client share on the wire, plus the
//! single-instance guard that owns the socket endpoint.
//!
//! - [`messages`] - JSON message vocabulary
//! - [`codec`] - 4-byte big-endian length framing
//! - [`instance`] - lock file, stale socket recovery, listener setup

pub mod codec;
pub mod instance;
pub mod messages;

pub use codec::{FrameDecoder, FrameError, FrameReader};
pub use messages::{BridgeMessage, ClientMessage, DeviceInfo, ErrorCode, PROTOCOL_VERSION};
