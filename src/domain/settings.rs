use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Directory name used under the platform config/data directories
pub const APP_DIR_NAME: &str = "HeartSync";
pub const SOCKET_FILE_NAME: &str = "bridge.sock";
pub const LOCK_FILE_NAME: &str = "bridge.lock";

/// Overrides the endpoint directory for both the bridge and its clients
pub const RUNTIME_DIR_ENV: &str = "HEARTSYNC_RUNTIME_DIR";
/// Forces the simulated adapter when set to `1` or `true`
pub const SIMULATE_ENV: &str = "HEARTSYNC_SIMULATE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    dirs::data_dir()
        .map(|d| d.join(APP_DIR_NAME).join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
        .to_string_lossy()
        .into_owned()
}
fn default_prefix() -> String {
    "heartsync_bridge".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// Which BLE backend the bridge drives; chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    #[default]
    Platform,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    #[serde(default)]
    pub log_settings: LogSettings,

    #[serde(default)]
    pub adapter: AdapterKind,
    /// Directory holding the socket and lock file; defaults to the per-user data dir
    #[serde(default)]
    pub runtime_dir: Option<String>,

    // Timing
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    // Simulation
    #[serde(default = "default_simulated_notify_interval_ms")]
    pub simulated_notify_interval_ms: u64,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            adapter: AdapterKind::default(),
            runtime_dir: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            simulated_notify_interval_ms: default_simulated_notify_interval_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_connect_timeout_ms() -> u64 {
    15000
}
fn default_probe_timeout_ms() -> u64 {
    1000
}
fn default_shutdown_grace_ms() -> u64 {
    1500
}
fn default_simulated_notify_interval_ms() -> u64 {
    1000
}

impl BridgeSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Socket and lock locations, honouring the environment override first
    pub fn endpoint_paths(&self) -> anyhow::Result<EndpointPaths> {
        if let Ok(dir) = std::env::var(RUNTIME_DIR_ENV) {
            if !dir.is_empty() {
                return Ok(EndpointPaths::in_dir(dir));
            }
        }
        if let Some(dir) = &self.runtime_dir {
            return Ok(EndpointPaths::in_dir(dir));
        }
        EndpointPaths::default_location()
    }
}

/// Fixed per-user location of the bridge endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPaths {
    pub dir: PathBuf,
    pub socket: PathBuf,
    pub lock: PathBuf,
}

impl EndpointPaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            socket: dir.join(SOCKET_FILE_NAME),
            lock: dir.join(LOCK_FILE_NAME),
            dir,
        }
    }

    pub fn default_location() -> anyhow::Result<Self> {
        let base = dirs::data_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| anyhow::anyhow!("Could not determine data directory"))?;
        Ok(Self::in_dir(base.join(APP_DIR_NAME)))
    }

    /// Resolve the endpoint a client should dial without loading bridge settings
    pub fn for_client() -> anyhow::Result<Self> {
        match std::env::var(RUNTIME_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => Ok(Self::in_dir(dir)),
            _ => Self::default_location(),
        }
    }
}

pub struct SettingsService {
    settings: BridgeSettings,
    settings_path: PathBuf,
}

impl SettingsService {
    /// Load the user settings file, writing defaults on first run
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        let first_run = !settings_path.exists();
        let service = Self::from_path(settings_path);
        if first_run {
            if let Err(e) = service.save() {
                tracing::warn!("Could not write default settings: {}", e);
            }
        }
        Ok(service)
    }

    /// Load from an explicit path, falling back to defaults when it is missing or invalid
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push(APP_DIR_NAME);
        fs::create_dir_all(&path)?;
        path.push("bridge.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<BridgeSettings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &BridgeSettings {
        &self.settings
    }

    /// Apply `HEARTSYNC_SIMULATE` and the `--simulate` switch on top of the file
    pub fn apply_overrides(&mut self, simulate: bool) {
        let env_simulate = std::env::var(SIMULATE_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if env_simulate || simulate {
            self.settings.adapter = AdapterKind::Simulated;
        }
    }
}
