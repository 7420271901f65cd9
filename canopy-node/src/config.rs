//! Load node config from file and environment.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use canopy_core::protocol::{BRANCHING_LIMIT, DEFAULT_PORT, MAX_CONNECT_ATTEMPTS};
use serde::Deserialize;

/// Node configuration. File: ~/.config/canopy/config.toml or /etc/canopy/config.toml.
/// Env overrides: CANOPY_BIND_ADDRESS, CANOPY_LISTEN_PORT, CANOPY_BRANCHING_LIMIT.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// Address root nodes listen on (default 0.0.0.0).
    #[serde(default = "default_bind_address")]
    pub bind_address: Ipv4Addr,
    /// Root listening port (default 6974). 0 picks an ephemeral port.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Children attached before joiners get redirected (default 2).
    #[serde(default = "default_branching_limit")]
    pub branching_limit: usize,
    /// Partial frame timeout.
    #[serde(default = "default_frame_timeout_ms")]
    pub frame_timeout_ms: u64,
    /// Bound on every blocking bootstrap read, write and accept.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Hairpin reconnect attempts before a candidate is abandoned.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
    /// How long teardown waits for each peer's disconnect acknowledgement.
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    /// Sleep after each full poll cycle.
    #[serde(default = "default_idle_backoff_us")]
    pub idle_backoff_us: u64,
}

fn default_bind_address() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}
fn default_listen_port() -> u16 {
    DEFAULT_PORT
}
fn default_branching_limit() -> usize {
    BRANCHING_LIMIT
}
fn default_frame_timeout_ms() -> u64 {
    3_000
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_connect_attempts() -> u32 {
    MAX_CONNECT_ATTEMPTS
}
fn default_connect_retry_delay_ms() -> u64 {
    10
}
fn default_disconnect_timeout_ms() -> u64 {
    3_000
}
fn default_idle_backoff_us() -> u64 {
    500
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            listen_port: default_listen_port(),
            branching_limit: default_branching_limit(),
            frame_timeout_ms: default_frame_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            idle_backoff_us: default_idle_backoff_us(),
        }
    }
}

impl NodeConfig {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_us)
    }

    /// Apply overrides from a variable lookup (the process environment in `load`).
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(a) = var("CANOPY_BIND_ADDRESS").and_then(|s| s.parse().ok()) {
            self.bind_address = a;
        }
        if let Some(p) = var("CANOPY_LISTEN_PORT").and_then(|s| s.parse().ok()) {
            self.listen_port = p;
        }
        if let Some(n) = var("CANOPY_BRANCHING_LIMIT").and_then(|s| s.parse().ok()) {
            self.branching_limit = n;
        }
    }
}

/// Load config: defaults, then the given file (or the first default path present), then env vars.
/// An explicit path must exist and parse; the default paths are best effort.
pub fn load(path: Option<&Path>) -> Result<NodeConfig, ConfigError> {
    let mut c = match path {
        Some(p) => load_path(p)?,
        None => load_file().unwrap_or_default(),
    };
    c.apply_overrides(|k| std::env::var(k).ok());
    Ok(c)
}

fn load_path(path: &Path) -> Result<NodeConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/canopy/config.toml"));
    }
    out.push(PathBuf::from("/etc/canopy/config.toml"));
    out
}

fn load_file() -> Option<NodeConfig> {
    for p in config_paths() {
        if p.exists() {
            return load_path(&p).ok();
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
