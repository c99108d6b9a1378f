use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::network::PoolConfig;
use crate::storage::ensure_parent_dir;

pub const DEFAULT_CONFIG_PATH: &str = "config/peer.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub listen_port: u16,
    /// Address announced to peers, e.g. `ws://xxxxxxxx.onion:2222`.
    /// Defaults to the loopback listener address.
    pub advertised_address: Option<String>,
    pub database_path: PathBuf,
    pub peer_id_path: PathBuf,
    pub file_dir: PathBuf,
    /// Peers dialed on startup
    pub known_peers: Vec<String>,
    pub pool: PoolSettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_port: 1111,
            advertised_address: None,
            database_path: PathBuf::from("data/skunk.db"),
            peer_id_path: PathBuf::from("data/peer_id"),
            file_dir: PathBuf::from("data/stored_files"),
            known_peers: Vec::new(),
            pool: PoolSettings::default(),
        }
    }
}

impl AppConfig {
    pub fn advertised_address(&self, bound_port: u16) -> String {
        self.advertised_address
            .clone()
            .unwrap_or_else(|| format!("ws://127.0.0.1:{bound_port}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub connect_timeout_secs: u64,
    pub write_timeout_secs: u64,
    pub read_interval_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 64,
            connect_timeout_secs: 60,
            write_timeout_secs: 20,
            read_interval_ms: 2000,
            heartbeat_interval_secs: 10,
            max_frame_bytes: 64 * 1024,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            write_timeout: Duration::from_secs(settings.write_timeout_secs),
            read_interval: Duration::from_millis(settings.read_interval_ms.max(1)),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs.max(1)),
            max_frame_bytes: settings.max_frame_bytes,
        }
    }
}

pub fn load_config(path: &str) -> AppConfig {
    let path = Path::new(path);
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<AppConfig>(&content) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("Failed to parse config file {}: {err}", path.display());
                AppConfig::default()
            }
        },
        Err(err) => {
            log::info!(
                "Config file {} not found ({err}); using defaults",
                path.display()
            );
            AppConfig::default()
        }
    }
}

pub fn save_config(path: &str, config: &AppConfig) -> io::Result<()> {
    let path = Path::new(path);
    ensure_parent_dir(path)?;
    fs::write(path, serde_json::to_string_pretty(config)?)
}

/// Moves `address` to the front of `known_peers` so it is dialed first on
/// the next start.
pub fn persist_known_peer(path: &str, address: &str) -> io::Result<()> {
    let mut config = load_config(path);
    if config.known_peers.first().map(String::as_str) == Some(address) {
        return Ok(());
    }
    config.known_peers.retain(|peer| peer != address);
    config.known_peers.insert(0, address.to_string());

    save_config(path, &config)?;
    log::info!("Persisted known peer {address} to {path}");
    Ok(())
}
