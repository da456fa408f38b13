//! Admin control-plane configuration.
//!
//! TOML configuration for the daemon: sampling intervals, the memory
//! proportion, idle-document cleanup, kit resource limits, monitor
//! endpoints and the console/metrics listeners.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Semantic validation failed.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AdminConfig {
    /// Console and metrics listener settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Admin credential settings.
    #[serde(default)]
    pub admin: AdminSection,

    /// Telemetry sampling settings.
    #[serde(default)]
    pub stats: StatsSection,

    /// Memory governance settings.
    #[serde(default)]
    pub memory: MemorySection,

    /// Idle-document / lost-kit cleanup settings.
    #[serde(default)]
    pub cleanup: CleanupSection,

    /// Per-kit resource limits, forwarded to the spawner.
    #[serde(default)]
    pub limits: KitLimits,

    /// External monitor endpoints.
    #[serde(default)]
    pub monitors: Vec<MonitorConfig>,

    /// Migration-capable deployment settings.
    #[serde(default)]
    pub indirection: IndirectionSection,
}

impl AdminConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if !(0.0..=100.0).contains(&self.memory.proportion_percent) {
            return Err(ConfigError::Validation(format!(
                "memory.proportion_percent must be within [0, 100], got {}",
                self.memory.proportion_percent
            )));
        }
        for monitor in &self.monitors {
            if !monitor.uri.starts_with("tcp://") {
                return Err(ConfigError::Validation(format!(
                    "monitor uri '{}' should be \"tcp://host:port/path\"",
                    monitor.uri
                )));
            }
        }
        Ok(())
    }
}

/// Console and metrics listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Unix socket path for the admin console.
    #[serde(default = "default_console_socket")]
    pub console_socket: PathBuf,

    /// TCP port for the plain-text metrics endpoint.
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Maximum concurrent console connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            console_socket: default_console_socket(),
            metrics_port: default_metrics_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Admin credential settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSection {
    /// Secret from which the token-verification key is derived.
    ///
    /// Overridable via `SCRIVD_ADMIN_SECRET` in the binary.
    #[serde(default = "default_admin_secret")]
    pub secret: String,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            secret: default_admin_secret(),
        }
    }
}

/// Telemetry sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSection {
    /// CPU sampling interval in milliseconds.
    #[serde(default = "default_cpu_interval_ms")]
    pub cpu_interval_ms: u64,

    /// Memory sampling interval in milliseconds.
    #[serde(default = "default_mem_interval_ms")]
    pub mem_interval_ms: u64,

    /// Network sampling interval in milliseconds.
    #[serde(default = "default_mem_interval_ms")]
    pub net_interval_ms: u64,

    /// Retained CPU history samples.
    #[serde(default = "default_stats_size")]
    pub cpu_stats_size: usize,

    /// Retained memory history samples.
    #[serde(default = "default_stats_size")]
    pub mem_stats_size: usize,

    /// Retained sent/received history samples.
    #[serde(default = "default_stats_size")]
    pub net_stats_size: usize,

    /// Retained connection-count history samples.
    #[serde(default = "default_stats_size")]
    pub connection_stats_size: usize,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            cpu_interval_ms: default_cpu_interval_ms(),
            mem_interval_ms: default_mem_interval_ms(),
            net_interval_ms: default_mem_interval_ms(),
            cpu_stats_size: default_stats_size(),
            mem_stats_size: default_stats_size(),
            net_stats_size: default_stats_size(),
            connection_stats_size: default_stats_size(),
        }
    }
}

/// Memory governance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySection {
    /// Proportion of system memory the server may use, percent.
    /// 0 disables the governor.
    #[serde(default)]
    pub proportion_percent: f64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            proportion_percent: 0.0,
        }
    }
}

/// Idle-document / lost-kit cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupSection {
    /// Whether the cleanup task runs at all.
    #[serde(default)]
    pub enable: bool,

    /// Cleanup task interval in milliseconds.
    #[serde(default = "default_cleanup_interval_ms")]
    pub interval_ms: u64,

    /// Grace period before a lost kit is terminated, seconds.
    /// 0 disables lost-kit reaping.
    #[serde(default = "default_lost_kit_grace_period_secs")]
    pub lost_kit_grace_period_secs: u64,

    /// Dirty-memory ceiling per document before cleanup considers it a
    /// resource hog, MB. 0 disables the check.
    #[serde(default)]
    pub limit_dirty_mem_mb: u64,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self {
            enable: false,
            interval_ms: default_cleanup_interval_ms(),
            lost_kit_grace_period_secs: default_lost_kit_grace_period_secs(),
            limit_dirty_mem_mb: 0,
        }
    }
}

/// Per-kit resource limits, forwarded to the spawner when changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KitLimits {
    /// Virtual memory ceiling per kit, MB (0 = none).
    #[serde(default)]
    pub limit_virt_mem_mb: u64,

    /// Stack size ceiling per kit, KB (0 = none).
    #[serde(default)]
    pub limit_stack_mem_kb: u64,

    /// File size ceiling per kit, MB (0 = none).
    #[serde(default)]
    pub limit_file_size_mb: u64,

    /// Open-file-descriptor ceiling per kit (0 = none).
    #[serde(default)]
    pub limit_num_open_files: u64,
}

/// One external monitor endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Endpoint URI, `tcp://host:port/path` form.
    pub uri: String,

    /// Reconnect delay after a disconnect, seconds.
    #[serde(default = "default_monitor_retry_secs")]
    pub retry_interval_secs: u64,
}

/// Migration-capable deployment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndirectionSection {
    /// Whether this deployment participates in routed migration.
    #[serde(default)]
    pub enable: bool,

    /// Bounded wait for migration acknowledgement at shutdown, seconds.
    #[serde(default = "default_migration_timeout_secs")]
    pub migration_timeout_secs: u64,
}

impl Default for IndirectionSection {
    fn default() -> Self {
        Self {
            enable: false,
            migration_timeout_secs: default_migration_timeout_secs(),
        }
    }
}

fn default_console_socket() -> PathBuf {
    std::env::var("XDG_RUNTIME_DIR").map_or_else(
        |_| PathBuf::from("/tmp/scrivd/admin.sock"),
        |dir| PathBuf::from(dir).join("scrivd").join("admin.sock"),
    )
}

fn default_metrics_port() -> u16 {
    9980
}

fn default_max_connections() -> usize {
    64
}

fn default_admin_secret() -> String {
    "change-me".to_string()
}

fn default_cpu_interval_ms() -> u64 {
    1000
}

fn default_mem_interval_ms() -> u64 {
    2000
}

fn default_stats_size() -> usize {
    100
}

fn default_cleanup_interval_ms() -> u64 {
    10_000
}

fn default_lost_kit_grace_period_secs() -> u64 {
    120
}

fn default_monitor_retry_secs() -> u64 {
    20
}

fn default_migration_timeout_secs() -> u64 {
    180
}
