//! Bridge Client
//!
//! Keeps one connection to the bridge alive on a background thread.
//! Every session starts with `handshake` followed by `status`. A session
//! ends when the bridge closes the socket, a transport error occurs, or no
//! `bridge_heartbeat` arrives within the liveness timeout. The thread then
//! reconnects following [`ReconnectPolicy`].

use crate::client::backoff::ReconnectPolicy;
use crate::infrastructure::ipc::{codec, BridgeMessage, ClientMessage, FrameError, FrameReader, PROTOCOL_VERSION};
use interprocess::local_socket::{
    traits::Stream as _, GenericFilePath, Stream as LocalStream, ToFsName,
};
use interprocess::TryClone;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket: PathBuf,
    /// Name announced in the handshake
    pub client_name: String,
    pub reconnect: ReconnectPolicy,
    /// Heartbeat silence longer than this ends the session
    pub liveness_timeout: Duration,
    /// Read timeout used to check liveness and stop requests.
    /// [`BridgeClient::stop`] takes at most this long to return.
    pub poll_interval: Duration,
}

impl ClientConfig {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
            client_name: "heartsync-monitor".to_string(),
            reconnect: ReconnectPolicy::default(),
            liveness_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    LinkUp,
    LinkDown { reason: String },
    Message(BridgeMessage),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to the bridge")]
    NotConnected,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("client writer lock poisoned")]
    Poisoned,
}

type SharedWriter = Arc<Mutex<Option<LocalStream>>>;

pub struct BridgeClient {
    writer: SharedWriter,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl BridgeClient {
    /// Start the connection thread; events are delivered on `events`
    pub fn start(config: ClientConfig, events: mpsc::UnboundedSender<ClientEvent>) -> io::Result<Self> {
        let writer: SharedWriter = Arc::new(Mutex::new(None));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_writer = writer.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("bridge-client".to_string())
            .spawn(move || connection_loop(config, thread_writer, thread_stop, events))?;

        Ok(Self {
            writer,
            stop,
            handle: Some(handle),
        })
    }

    /// Send a command on the current session
    pub fn send(&self, message: &ClientMessage) -> Result<(), ClientError> {
        let mut slot = self.writer.lock().map_err(|_| ClientError::Poisoned)?;
        let stream = slot.as_mut().ok_or(ClientError::NotConnected)?;
        codec::write_frame(stream, message)?;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.writer.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Close the session and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn connection_loop(
    config: ClientConfig,
    writer: SharedWriter,
    stop: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut attempt = 0u32;
    while !stop.load(Ordering::SeqCst) {
        match dial(&config.socket) {
            Ok(stream) => {
                attempt = 0;
                let reason = match run_session(&config, stream, &writer, &stop, &events) {
                    Ok(reason) => reason,
                    Err(e) => e.to_string(),
                };
                if let Ok(mut slot) = writer.lock() {
                    *slot = None;
                }
                info!("Bridge link down: {}", reason);
                if events.send(ClientEvent::LinkDown { reason }).is_err() {
                    return;
                }
            }
            Err(e) => debug!(socket = ?config.socket, "Bridge not reachable: {}", e),
        }

        let delay = config.reconnect.delay(attempt);
        attempt = attempt.saturating_add(1);
        sleep_unless_stopped(delay, &stop);
    }
    debug!("Bridge client thread finished");
}

fn dial(socket: &Path) -> io::Result<LocalStream> {
    let name = socket.to_fs_name::<GenericFilePath>()?;
    LocalStream::connect(name)
}

/// Returns the reason the session ended
fn run_session(
    config: &ClientConfig,
    stream: LocalStream,
    writer: &SharedWriter,
    stop: &AtomicBool,
    events: &mpsc::UnboundedSender<ClientEvent>,
) -> Result<String, ClientError> {
    stream.set_recv_timeout(Some(config.poll_interval)).map_err(FrameError::from)?;
    let mut write_half = stream.try_clone().map_err(FrameError::from)?;

    codec::write_frame(
        &mut write_half,
        &ClientMessage::Handshake {
            version: Some(PROTOCOL_VERSION),
            client: Some(config.client_name.clone()),
        },
    )?;
    codec::write_frame(&mut write_half, &ClientMessage::Status)?;
    *writer.lock().map_err(|_| ClientError::Poisoned)? = Some(write_half);

    info!(socket = ?config.socket, "Connected to bridge");
    let _ = events.send(ClientEvent::LinkUp);

    let mut reader = FrameReader::new(stream);
    let mut last_heartbeat = Instant::now();
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok("stopped".to_string());
        }
        match reader.next_message::<BridgeMessage>() {
            Ok(Some(message)) => {
                if matches!(message, BridgeMessage::BridgeHeartbeat { .. }) {
                    last_heartbeat = Instant::now();
                }
                if events.send(ClientEvent::Message(message)).is_err() {
                    return Ok("event receiver dropped".to_string());
                }
            }
            Ok(None) => return Ok("bridge closed the connection".to_string()),
            Err(e) if e.is_timeout() => {}
            Err(e) if !e.is_fatal() => warn!("Ignoring malformed bridge message: {}", e),
            Err(e) => return Err(e.into()),
        }
        if last_heartbeat.elapsed() > config.liveness_timeout {
            warn!("No heartbeat for {:?}", last_heartbeat.elapsed());
            return Ok("heartbeat timeout".to_string());
        }
    }
}

fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let step = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        std::thread::sleep(step.min(deadline - now));
    }
}
