//! Command-line bridge client
//!
//! Connects to the running bridge, scans, connects to a sensor and prints
//! each reading with its smoothed and control values.
//!
//! ```text
//! heartsync-monitor [--connect <id>] [--no-auto] [--smoothing <s>]
//!                   [--offset <bpm>] [--control-offset <n>] [--raw]
//! ```

use clap::Parser;
use heartsync_bridge::client::{
    BridgeClient, ClientConfig, ClientEvent, HeartRateMonitor,
};
use heartsync_bridge::domain::settings::{EndpointPaths, LogSettings};
use heartsync_bridge::domain::signal::{ControlSource, SignalProcessor};
use heartsync_bridge::infrastructure::ipc::{BridgeMessage, ClientMessage};
use heartsync_bridge::infrastructure::logging;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "heartsync-monitor", version, about = "Print heart rate readings from the bridge")]
struct Options {
    /// Connect to this device id instead of the first one found
    #[arg(long)]
    connect: Option<String>,

    /// Only connect when --connect names the device
    #[arg(long = "no-auto", action = clap::ArgAction::SetFalse)]
    auto_connect: bool,

    /// Smoothing factor s; alpha = 1 / (1 + s)
    #[arg(long, default_value_t = 2.0)]
    smoothing: f64,

    /// Added to every reading before smoothing
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    offset: i32,

    /// Added to the control value
    #[arg(
        long,
        default_value_t = 0,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i32).range(-100..=100)
    )]
    control_offset: i32,

    /// Drive the control value from raw readings
    #[arg(long)]
    raw: bool,
}

impl Options {
    /// Which scanned device to connect to, if any
    fn wants(&self, device_id: &str) -> bool {
        match &self.connect {
            Some(id) => id == device_id,
            None => self.auto_connect,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();

    let log_settings = LogSettings {
        file_logging_enabled: false,
        file_name_prefix: "heartsync_monitor".to_string(),
        level: "warn".to_string(),
        ..LogSettings::default()
    };
    let _log_guard = logging::init_logger(&log_settings)?;

    let mut processor = SignalProcessor::new(options.smoothing)?;
    processor.set_offset(options.offset);
    processor.set_control_offset(options.control_offset);
    if options.raw {
        processor.set_source(ControlSource::Raw);
    }
    let metrics = processor.metrics();
    info!(
        alpha = metrics.alpha,
        half_life = metrics.half_life_samples,
        "Smoothing configured"
    );
    let mut monitor = HeartRateMonitor::new(processor);

    let paths = EndpointPaths::for_client()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = BridgeClient::start(ClientConfig::new(&paths.socket), tx)?;
    println!("Waiting for bridge at {}", paths.socket.display());

    let mut requested = false;
    loop {
        let event = tokio::select! {
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        };

        let output = monitor.apply(&event);
        match &event {
            ClientEvent::LinkUp => {
                requested = false;
                println!("Bridge connected");
            }
            ClientEvent::LinkDown { reason } => println!("Bridge link lost: {}", reason),
            ClientEvent::Message(BridgeMessage::Status { connected, .. }) => {
                if !connected && !requested {
                    if let Err(e) = client.send(&ClientMessage::Scan { on: true }) {
                        warn!("Could not start scan: {}", e);
                    }
                }
            }
            ClientEvent::Message(BridgeMessage::DeviceFound { device }) => {
                println!("Found {} ({}) {} dBm", device.name, device.id, device.rssi);
                if !requested && options.wants(&device.id) {
                    requested = true;
                    if let Err(e) = client.send(&ClientMessage::Connect { id: device.id.clone() }) {
                        warn!("Could not request connection: {}", e);
                        requested = false;
                    }
                }
            }
            ClientEvent::Message(BridgeMessage::Connected { device_id, name }) => {
                println!("Connected to {}", name.as_deref().unwrap_or(device_id));
            }
            ClientEvent::Message(BridgeMessage::Disconnected { device_id, reason }) => {
                println!(
                    "Disconnected from {} ({})",
                    device_id,
                    reason.as_deref().unwrap_or("unknown")
                );
                requested = false;
            }
            ClientEvent::Message(BridgeMessage::Permission { state }) => {
                println!("Bluetooth permission: {}", state);
            }
            ClientEvent::Message(BridgeMessage::Error { code, message }) => {
                println!("Bridge error {:?}: {}", code, message);
                requested = false;
            }
            _ => {}
        }

        if let (Some(output), Some(bpm)) = (output, monitor.snapshot().last_bpm) {
            println!(
                "{:>3} bpm  smoothed {:>6.1}  control {:>5.1}",
                bpm, output.smoothed, output.control
            );
        }
    }

    if monitor.snapshot().connected_device.is_some() {
        let _ = client.send(&ClientMessage::Disconnect);
    }
    client.stop();
    Ok(())
}
