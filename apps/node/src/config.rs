//! Node configuration.
//!
//! Stored as TOML:
//! - Linux: `~/.config/tandem/node.toml`
//! - Windows: `%APPDATA%/tandem/node.toml`

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_coordinator::CoordinatorConfig;
use tandem_devices::{RegistryConfig, SimulatedTransportConfig};
use tandem_transfer::{RetryPolicy, StoreConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name of this node (hostname by default).
    #[serde(default = "default_name")]
    pub name: String,

    /// Chunk server port (0 = auto-assign).
    #[serde(default)]
    pub port: u16,

    /// Where received chunks are staged and merged files land.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,

    /// Primary-channel chunk size in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_max_pending_uploads")]
    pub max_pending_uploads: usize,

    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Attempts per chunk, including the first.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_secondary_mtu")]
    pub secondary_mtu: usize,

    /// Simulated per-chunk latency on secondary channels.
    #[serde(default = "default_secondary_latency_ms")]
    pub secondary_latency_ms: u64,

    #[serde(default = "default_max_parallel_per_device")]
    pub max_parallel_per_device: usize,

    /// Transfers started once the node is up.
    #[serde(default, rename = "send", skip_serializing_if = "Vec::is_empty")]
    pub sends: Vec<SendJob>,
}

/// One file to send at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendJob {
    pub path: String,
    /// Receiving chunk server, e.g. `ws://10.0.0.2:7500`. Without one the
    /// primary share lands in this node's own store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_url: Option<String>,
    /// Secondary device ids.
    #[serde(default)]
    pub devices: Vec<String>,
}

fn default_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tandem node".into())
}

fn default_upload_dir() -> String {
    "~/Tandem/uploads".into()
}

fn default_chunk_size() -> usize {
    tandem_transfer::DEFAULT_CHUNK_SIZE
}

fn default_max_pending_uploads() -> usize {
    10
}

fn default_max_concurrent_transfers() -> usize {
    10
}

fn default_monitor_interval_ms() -> u64 {
    500
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_secondary_mtu() -> usize {
    4096
}

fn default_secondary_latency_ms() -> u64 {
    50
}

fn default_max_parallel_per_device() -> usize {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: 0,
            upload_dir: default_upload_dir(),
            chunk_size: default_chunk_size(),
            max_pending_uploads: default_max_pending_uploads(),
            max_concurrent_transfers: default_max_concurrent_transfers(),
            monitor_interval_ms: default_monitor_interval_ms(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            secondary_mtu: default_secondary_mtu(),
            secondary_latency_ms: default_secondary_latency_ms(),
            max_parallel_per_device: default_max_parallel_per_device(),
            sends: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from disk, or creates a default if not found.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&config_path()?)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn upload_path(&self) -> PathBuf {
        expand_home(&self.upload_dir)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_pending_uploads: self.max_pending_uploads,
            ..StoreConfig::new(self.upload_path())
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_concurrent_transfers: self.max_concurrent_transfers,
            monitor_interval: Duration::from_millis(self.monitor_interval_ms),
            chunk_size: self.chunk_size,
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
            },
        }
    }

    pub fn transport_config(&self) -> SimulatedTransportConfig {
        SimulatedTransportConfig {
            mtu: self.secondary_mtu,
            chunk_latency: Duration::from_millis(self.secondary_latency_ms),
            ..SimulatedTransportConfig::default()
        }
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_parallel_per_device: self.max_parallel_per_device,
        }
    }
}

/// Expands a leading `~/` to `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
            PathBuf::from(home).join(rest)
        }
        None => PathBuf::from(path),
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        Ok(PathBuf::from(home)
            .join(".config")
            .join("tandem")
            .join("node.toml"))
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("tandem").join("node.toml"))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        Ok(PathBuf::from("/tmp/tandem/node.toml"))
    }
}
