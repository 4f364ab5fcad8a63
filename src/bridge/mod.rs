//! Bridge Core
//!
//! Everything that touches bridge state runs on one actor task fed by a
//! single unbounded queue of [`BridgeEvent`]s. Socket threads, adapter
//! callbacks and the heartbeat timer only ever enqueue.

pub mod manager;
pub mod server;

use crate::infrastructure::bluetooth::AdapterEvent;
use crate::infrastructure::ipc::ClientMessage;
use interprocess::local_socket::Stream as LocalStream;

pub use manager::ConnectionManager;
pub use server::{spawn_accept_loop, spawn_heartbeat, AcceptLoop, BridgeServer, ServerConfig};

/// Input to the bridge actor
#[derive(Debug)]
pub enum BridgeEvent {
    /// A client connected; the actor decides whether to keep it
    ClientAttached(LocalStream),
    ClientMessage { client_id: u64, message: ClientMessage },
    /// A correctly framed payload that did not parse
    ClientInvalid { client_id: u64, error: String },
    ClientDetached { client_id: u64 },
    Adapter(AdapterEvent),
    HeartbeatTick,
    Shutdown,
}
