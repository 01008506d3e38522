//! Agent configuration

use agent_lib::{FileSinkConfig, ReactorConfig, RiemannSinkConfig};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Where normalized records are sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    File,
    Riemann,
    Log,
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Unix socket of the container engine API
    #[serde(default = "default_engine_socket")]
    pub engine_socket: PathBuf,

    /// Resume marker, also watched by the watchdog
    #[serde(default = "default_marker_path")]
    pub marker_path: PathBuf,

    #[serde(default = "default_sink")]
    pub sink: SinkKind,

    /// Output file of the file sink
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    #[serde(default = "default_rotate_secs")]
    pub rotate_secs: u64,

    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,

    /// Retention of rotated files
    #[serde(default = "default_keep_secs")]
    pub keep_secs: u64,

    #[serde(default = "default_riemann_host")]
    pub riemann_host: String,

    #[serde(default = "default_riemann_port")]
    pub riemann_port: u16,

    /// Reported as the origin of every record
    #[serde(default = "default_hostname")]
    pub hostname: String,

    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_ms: u64,

    #[serde(default = "default_resume_margin")]
    pub resume_margin_secs: u64,

    #[serde(default = "default_read_size")]
    pub read_size: usize,

    /// Bound on one engine request before its response head
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_record_ttl")]
    pub record_ttl_secs: u32,

    /// API server port for health/metrics, 0 disables it
    #[serde(default = "default_api_port")]
    pub api_port: u16,
}

fn default_engine_socket() -> PathBuf {
    PathBuf::from("/var/run/docker.sock")
}

fn default_marker_path() -> PathBuf {
    PathBuf::from("/srv/events/since")
}

fn default_sink() -> SinkKind {
    SinkKind::File
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/srv/events/containers.log")
}

fn default_rotate_secs() -> u64 {
    60
}

fn default_rotate_bytes() -> u64 {
    1024 * 1024
}

fn default_keep_secs() -> u64 {
    3600
}

fn default_riemann_host() -> String {
    "localhost".to_string()
}

fn default_riemann_port() -> u16 {
    5555
}

fn default_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_discovery_interval() -> u64 {
    1000
}

fn default_resume_margin() -> u64 {
    10
}

fn default_read_size() -> usize {
    8192
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_record_ttl() -> u32 {
    60
}

fn default_api_port() -> u16 {
    9102
}

impl AgentConfig {
    /// Load configuration from `AGENT_*` environment variables
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("AGENT").try_parsing(true))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()
            .context("Failed to read agent configuration")?
            .try_deserialize()
            .context("Invalid agent configuration")
    }

    pub fn reactor(&self) -> ReactorConfig {
        ReactorConfig {
            discovery_interval: Duration::from_millis(self.discovery_interval_ms),
            resume_margin: Duration::from_secs(self.resume_margin_secs),
            read_size: self.read_size,
            connect_timeout: self.connect_timeout(),
            ..ReactorConfig::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn file_sink(&self) -> FileSinkConfig {
        FileSinkConfig {
            path: self.log_path.clone(),
            rotate_after: Duration::from_secs(self.rotate_secs),
            rotate_bytes: self.rotate_bytes,
            keep: Duration::from_secs(self.keep_secs),
        }
    }

    pub fn riemann_sink(&self) -> RiemannSinkConfig {
        RiemannSinkConfig {
            host: self.riemann_host.clone(),
            port: self.riemann_port,
            hostname: self.hostname.clone(),
            ..RiemannSinkConfig::default()
        }
    }
}
