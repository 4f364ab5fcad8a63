//! Bridge Server
//!
//! Actor that owns the [`ConnectionManager`] and the single client slot.
//!
//! ```text
//!  accept thread ─┐
//!  client reader ─┤
//!  adapter tasks ─┼──▶ BridgeEvent queue ──▶ BridgeServer::run ──▶ client writer thread
//!  heartbeat     ─┘
//! ```
//!
//! A second client is refused by closing its stream right after accept.
//! Detaching a client never touches the sensor link.

use crate::bridge::{BridgeEvent, ConnectionManager};
use crate::domain::models::unix_timestamp;
use crate::infrastructure::ipc::{codec, BridgeMessage, ClientMessage, ErrorCode, FrameReader};
use interprocess::local_socket::{
    traits::{ListenerExt, Stream as _},
    GenericFilePath, Listener, Stream as LocalStream, ToFsName,
};
use interprocess::TryClone;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for the sensor to be released
    pub shutdown_grace: Duration,
}

struct ClientSession {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

pub struct BridgeServer {
    manager: ConnectionManager,
    sender: mpsc::UnboundedSender<BridgeEvent>,
    events: mpsc::UnboundedReceiver<BridgeEvent>,
    client: Option<ClientSession>,
    next_client_id: u64,
    config: ServerConfig,
}

impl BridgeServer {
    pub fn new(
        manager: ConnectionManager,
        sender: mpsc::UnboundedSender<BridgeEvent>,
        events: mpsc::UnboundedReceiver<BridgeEvent>,
        config: ServerConfig,
    ) -> Self {
        Self {
            manager,
            sender,
            events,
            client: None,
            next_client_id: 0,
            config,
        }
    }

    /// Process events until [`BridgeEvent::Shutdown`], then release the sensor
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Bridge server running");
        while let Some(event) = self.events.recv().await {
            if matches!(event, BridgeEvent::Shutdown) {
                break;
            }
            self.dispatch(event);
        }
        self.shutdown().await;
        Ok(())
    }

    fn dispatch(&mut self, event: BridgeEvent) {
        let mut out = Vec::new();
        match event {
            BridgeEvent::ClientAttached(stream) => {
                self.attach(stream);
                return;
            }
            BridgeEvent::ClientMessage { client_id, message } => {
                if !self.is_current(client_id) {
                    return;
                }
                debug!(client_id, ?message, "Client command");
                self.manager.handle_client(message, &mut out);
            }
            BridgeEvent::ClientInvalid { client_id, error } => {
                if !self.is_current(client_id) {
                    return;
                }
                warn!(client_id, "Discarding invalid message: {}", error);
                out.push(BridgeMessage::error(ErrorCode::InvalidMessage, error));
            }
            BridgeEvent::ClientDetached { client_id } => {
                if self.is_current(client_id) {
                    info!(client_id, "Client detached, sensor link kept");
                    self.client = None;
                }
                return;
            }
            BridgeEvent::Adapter(adapter_event) => {
                self.manager.handle_adapter(adapter_event, &mut out);
            }
            BridgeEvent::HeartbeatTick => {
                if self.client.is_some() {
                    out.push(BridgeMessage::BridgeHeartbeat {
                        timestamp: unix_timestamp(),
                    });
                }
            }
            BridgeEvent::Shutdown => {}
        }
        self.send_all(out);
    }

    fn is_current(&self, client_id: u64) -> bool {
        self.client.as_ref().is_some_and(|c| c.id == client_id)
    }

    fn attach(&mut self, stream: LocalStream) {
        if let Some(current) = &self.client {
            warn!(current = current.id, "Refusing second client connection");
            drop(stream);
            return;
        }

        self.next_client_id += 1;
        let id = self.next_client_id;
        match spawn_client_io(id, stream, self.sender.clone()) {
            Ok(outbound) => {
                info!(client_id = id, "Client attached");
                self.client = Some(ClientSession { id, outbound });
                let greeting = self.manager.greeting();
                self.send_all(greeting);
            }
            Err(e) => error!("Could not start client I/O: {}", e),
        }
    }

    fn send_all(&mut self, messages: Vec<BridgeMessage>) {
        let Some(client) = &self.client else {
            if !messages.is_empty() {
                trace!(count = messages.len(), "No client attached, messages dropped");
            }
            return;
        };

        for message in messages {
            let frame = match codec::encode(&message) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Could not encode {}: {}", message.kind(), e);
                    continue;
                }
            };
            trace!(kind = message.kind(), "Sending");
            if client.outbound.send(frame).is_err() {
                debug!(client_id = client.id, "Writer gone, detaching");
                self.client = None;
                return;
            }
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down bridge");
        let mut out = Vec::new();
        let pending = self.manager.begin_shutdown(&mut out);
        self.send_all(out);

        if pending {
            let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
            while !self.manager.is_idle() {
                match tokio::time::timeout_at(deadline, self.events.recv()).await {
                    Ok(Some(BridgeEvent::Adapter(event))) => {
                        let mut out = Vec::new();
                        self.manager.handle_adapter(event, &mut out);
                        self.send_all(out);
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => {
                        warn!("Sensor release did not finish within {:?}", self.config.shutdown_grace);
                        break;
                    }
                }
            }
        }

        self.manager.finish_shutdown();
        self.client = None;
        info!("Bridge server stopped");
    }
}

/// Start the reader and writer threads for one client.
/// Returns the queue feeding the writer.
fn spawn_client_io(
    client_id: u64,
    stream: LocalStream,
    events: mpsc::UnboundedSender<BridgeEvent>,
) -> io::Result<mpsc::UnboundedSender<Vec<u8>>> {
    let read_half = stream.try_clone()?;
    let (outbound, mut frames) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_events = events.clone();
    std::thread::Builder::new()
        .name(format!("client-{}-writer", client_id))
        .spawn(move || {
            let mut stream = stream;
            while let Some(frame) = frames.blocking_recv() {
                if let Err(e) = stream.write_all(&frame).and_then(|_| stream.flush()) {
                    warn!(client_id, "Write failed: {}", e);
                    let _ = writer_events.send(BridgeEvent::ClientDetached { client_id });
                    break;
                }
            }
            debug!(client_id, "Writer finished");
        })?;

    std::thread::Builder::new()
        .name(format!("client-{}-reader", client_id))
        .spawn(move || read_loop(client_id, read_half, events))?;

    Ok(outbound)
}

fn read_loop(client_id: u64, stream: LocalStream, events: mpsc::UnboundedSender<BridgeEvent>) {
    let mut reader = FrameReader::new(stream);
    loop {
        match reader.next_payload() {
            Ok(Some(payload)) => {
                let event = match codec::decode_payload::<ClientMessage>(&payload) {
                    Ok(message) => BridgeEvent::ClientMessage { client_id, message },
                    Err(e) => BridgeEvent::ClientInvalid {
                        client_id,
                        error: e.to_string(),
                    },
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(None) => {
                info!(client_id, "Client closed the connection");
                break;
            }
            Err(e) => {
                warn!(client_id, "Closing client connection: {}", e);
                break;
            }
        }
    }
    let _ = events.send(BridgeEvent::ClientDetached { client_id });
}

/// Handle to the blocking accept thread
pub struct AcceptLoop {
    stop: Arc<AtomicBool>,
    socket: PathBuf,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl AcceptLoop {
    /// Ask the thread to exit and wake it with a throwaway connection
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let woke = match self.socket.as_path().to_fs_name::<GenericFilePath>() {
            Ok(name) => LocalStream::connect(name).is_ok(),
            Err(_) => false,
        };
        if let Some(handle) = self.handle.take() {
            if woke {
                let _ = handle.join();
            } else {
                debug!("Accept thread not woken, leaving it detached");
            }
        }
    }
}

/// Run the accept loop on its own thread
pub fn spawn_accept_loop(
    listener: Listener,
    socket: PathBuf,
    events: mpsc::UnboundedSender<BridgeEvent>,
) -> io::Result<AcceptLoop> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let handle = std::thread::Builder::new()
        .name("accept".to_string())
        .spawn(move || {
            for conn in listener.incoming() {
                if thread_stop.load(Ordering::SeqCst) {
                    break;
                }
                match conn {
                    Ok(stream) => {
                        debug!("Incoming connection");
                        if events.send(BridgeEvent::ClientAttached(stream)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        std::thread::sleep(Duration::from_millis(100));
                    }
                }
            }
            info!("Accept loop stopped");
        })?;

    Ok(AcceptLoop {
        stop,
        socket,
        handle: Some(handle),
    })
}

/// Enqueue a heartbeat tick every `interval`
pub fn spawn_heartbeat(
    interval: Duration,
    events: mpsc::UnboundedSender<BridgeEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if events.send(BridgeEvent::HeartbeatTick).is_err() {
                break;
            }
        }
    })
}
