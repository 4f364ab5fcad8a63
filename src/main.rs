use clap::Parser;
use heartsync_bridge::bridge::{self, BridgeEvent, BridgeServer, ConnectionManager, ServerConfig};
use heartsync_bridge::domain::settings::SettingsService;
use heartsync_bridge::infrastructure::bluetooth;
use heartsync_bridge::infrastructure::ipc::instance::{Acquire, InstanceGuard};
use heartsync_bridge::infrastructure::logging;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "heartsync-bridge", version, about = "Headless BLE heart-rate bridge")]
struct Args {
    /// Use the simulated sensor instead of the Bluetooth adapter
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let mut settings_service = SettingsService::new()?;
    settings_service.apply_overrides(args.simulate);
    let settings = settings_service.get().clone();

    let _log_guard = logging::init_logger(&settings.log_settings)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        adapter = ?settings.adapter,
        "Starting HeartSync bridge"
    );

    let paths = settings.endpoint_paths()?;
    let mut guard = match InstanceGuard::acquire(&paths, settings.probe_timeout()) {
        Ok(Acquire::Acquired(guard)) => guard,
        Ok(Acquire::AlreadyRunning) => {
            info!(socket = ?paths.socket, "Another bridge owns the endpoint, exiting");
            return Ok(ExitCode::from(1));
        }
        Err(e) => {
            error!("Could not claim the bridge endpoint: {}", e);
            return Err(e.into());
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<BridgeEvent>();

    let adapter = match bluetooth::create_adapter(&settings, tx.clone()).await {
        Ok(adapter) => adapter,
        Err(e) => {
            error!("Bluetooth adapter unavailable: {:#}", e);
            guard.release();
            return Err(e);
        }
    };
    let manager = ConnectionManager::new(adapter);
    let server = BridgeServer::new(
        manager,
        tx.clone(),
        rx,
        ServerConfig {
            heartbeat_interval: settings.heartbeat_interval(),
            shutdown_grace: settings.shutdown_grace(),
        },
    );

    let Some(listener) = guard.take_listener() else {
        anyhow::bail!("listener already taken");
    };
    let accept_loop = bridge::spawn_accept_loop(listener, paths.socket.clone(), tx.clone())?;
    let heartbeat = bridge::spawn_heartbeat(settings.heartbeat_interval(), tx.clone());
    let server_task = tokio::spawn(server.run());

    wait_for_termination().await?;
    info!("Termination requested");

    let _ = tx.send(BridgeEvent::Shutdown);
    heartbeat.abort();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Bridge server failed: {:#}", e),
        Err(e) => error!("Bridge server task panicked: {}", e),
    }

    accept_loop.stop();
    guard.release();
    info!("HeartSync bridge stopped");
    Ok(ExitCode::SUCCESS)
}

async fn wait_for_termination() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
    Ok(())
}
