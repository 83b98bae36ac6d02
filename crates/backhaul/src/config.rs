//! Tunnel configuration with layered sources
//!
//! Each setting is resolved in this order (first found wins):
//! 1. Command line flags
//! 2. Environment variables (BACKHAUL_*)
//! 3. Config file (`--config`, else `~/.config/backhaul/config.toml`)
//! 4. Default values (where applicable)

use std::path::{Path, PathBuf};
use std::time::Duration;

use backhaul_relay::{RelayOptions, ServeOptions, DEFAULT_ACCEPT_RETRY_DELAY, DEFAULT_BUFFER_SIZE};
use backhaul_ssh::{expand_key_path, HostKeyPolicy, SshConfig};
use serde::Deserialize;
use thiserror::Error;

/// Environment variable prefix
const ENV_PREFIX: &str = "BACKHAUL";

const DEFAULT_PROXY_SSH_PORT: u16 = 22;
const DEFAULT_PROXY_PORT: u16 = 11111;
const DEFAULT_LOCAL_PORT: u16 = 21112;
const DEFAULT_REMOTE_BIND: &str = "0.0.0.0";
const DEFAULT_LOCAL_HOST: &str = "127.0.0.1";
const DEFAULT_KEY: &str = "id_ed25519";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("proxy-host is required. Use --proxy-host, BACKHAUL_PROXY_HOST or the config file")]
    MissingProxyHost,

    #[error("Invalid host key policy '{0}'. Use 'accept-any' or 'known-hosts'")]
    InvalidHostKeyPolicy(String),

    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// One source of settings; every field is optional
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct ConfigLayer {
    pub proxy_host: Option<String>,
    pub proxy_user: Option<String>,
    pub proxy_ssh_port: Option<u16>,
    pub proxy_port: Option<u16>,
    pub remote_bind: Option<String>,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub key: Option<String>,
    pub host_key_policy: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub max_connections: Option<usize>,
    pub connect_timeout_secs: Option<u64>,
    pub reconnect: Option<bool>,
    pub reconnect_delay_secs: Option<u64>,
}

impl ConfigLayer {
    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("backhaul")
            .join("config.toml")
    }

    /// Load a layer from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load the explicit config file, or the default one if it exists
    pub fn load_file(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => {
                let path = Self::default_path();
                if path.exists() {
                    tracing::debug!("Using config file {}", path.display());
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Read BACKHAUL_* variables from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a layer from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(&format!("{}_{}", ENV_PREFIX, name));

        Ok(Self {
            proxy_host: get("PROXY_HOST"),
            proxy_user: get("PROXY_USER"),
            proxy_ssh_port: parse_env(&get, "PROXY_SSH_PORT")?,
            proxy_port: parse_env(&get, "PROXY_PORT")?,
            remote_bind: get("REMOTE_BIND"),
            local_host: get("LOCAL_HOST"),
            local_port: parse_env(&get, "LOCAL_PORT")?,
            key: get("KEY"),
            host_key_policy: get("HOST_KEY_POLICY"),
            idle_timeout_secs: parse_env(&get, "IDLE_TIMEOUT_SECS")?,
            max_connections: parse_env(&get, "MAX_CONNECTIONS")?,
            connect_timeout_secs: parse_env(&get, "CONNECT_TIMEOUT_SECS")?,
            reconnect: parse_env(&get, "RECONNECT")?,
            reconnect_delay_secs: parse_env(&get, "RECONNECT_DELAY_SECS")?,
        })
    }

    /// Fill every unset field from `lower`
    pub fn or(self, lower: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            proxy_host: self.proxy_host.or(lower.proxy_host),
            proxy_user: self.proxy_user.or(lower.proxy_user),
            proxy_ssh_port: self.proxy_ssh_port.or(lower.proxy_ssh_port),
            proxy_port: self.proxy_port.or(lower.proxy_port),
            remote_bind: self.remote_bind.or(lower.remote_bind),
            local_host: self.local_host.or(lower.local_host),
            local_port: self.local_port.or(lower.local_port),
            key: self.key.or(lower.key),
            host_key_policy: self.host_key_policy.or(lower.host_key_policy),
            idle_timeout_secs: self.idle_timeout_secs.or(lower.idle_timeout_secs),
            max_connections: self.max_connections.or(lower.max_connections),
            connect_timeout_secs: self.connect_timeout_secs.or(lower.connect_timeout_secs),
            reconnect: self.reconnect.or(lower.reconnect),
            reconnect_delay_secs: self.reconnect_delay_secs.or(lower.reconnect_delay_secs),
        }
    }
}

fn parse_env<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match get(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: format!("{}_{}", ENV_PREFIX, name),
                value,
            }),
    }
}

fn parse_host_key_policy(value: &str) -> Result<HostKeyPolicy, ConfigError> {
    match value {
        "accept-any" => Ok(HostKeyPolicy::AcceptAny),
        "known-hosts" => Ok(HostKeyPolicy::KnownHosts),
        other => Err(ConfigError::InvalidHostKeyPolicy(other.to_string())),
    }
}

/// Fully resolved tunnel configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub proxy_host: String,
    pub proxy_user: String,
    pub proxy_ssh_port: u16,
    pub proxy_port: u16,
    pub remote_bind: String,
    pub local_host: String,
    pub local_port: u16,
    pub key_path: PathBuf,
    pub host_key_policy: HostKeyPolicy,
    pub idle_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
    pub connect_timeout: Duration,
    pub reconnect: bool,
    pub reconnect_delay: Duration,
}

impl TunnelConfig {
    /// Apply defaults and validate a merged layer
    pub fn resolve(layer: ConfigLayer) -> Result<Self, ConfigError> {
        let proxy_host = layer
            .proxy_host
            .filter(|h| !h.trim().is_empty())
            .ok_or(ConfigError::MissingProxyHost)?;

        let host_key_policy = match layer.host_key_policy.as_deref() {
            Some(value) => parse_host_key_policy(value)?,
            None => HostKeyPolicy::default(),
        };

        Ok(Self {
            proxy_host,
            proxy_user: layer.proxy_user.unwrap_or_default(),
            proxy_ssh_port: layer.proxy_ssh_port.unwrap_or(DEFAULT_PROXY_SSH_PORT),
            proxy_port: layer.proxy_port.unwrap_or(DEFAULT_PROXY_PORT),
            remote_bind: layer
                .remote_bind
                .unwrap_or_else(|| DEFAULT_REMOTE_BIND.to_string()),
            local_host: layer
                .local_host
                .unwrap_or_else(|| DEFAULT_LOCAL_HOST.to_string()),
            local_port: layer.local_port.unwrap_or(DEFAULT_LOCAL_PORT),
            key_path: expand_key_path(layer.key.as_deref().unwrap_or(DEFAULT_KEY)),
            host_key_policy,
            idle_timeout: layer
                .idle_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            max_connections: layer.max_connections.filter(|n| *n > 0),
            connect_timeout: Duration::from_secs(
                layer
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            reconnect: layer.reconnect.unwrap_or(false),
            reconnect_delay: Duration::from_secs(
                layer
                    .reconnect_delay_secs
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
            ),
        })
    }

    pub fn ssh_config(&self) -> SshConfig {
        SshConfig {
            host: self.proxy_host.clone(),
            port: self.proxy_ssh_port,
            user: self.proxy_user.clone(),
            key_path: self.key_path.clone(),
            host_key_policy: self.host_key_policy,
            connect_timeout: self.connect_timeout,
            keepalive_interval: KEEPALIVE_INTERVAL,
        }
    }

    pub fn serve_options(&self) -> ServeOptions {
        ServeOptions {
            relay: RelayOptions {
                idle_timeout: self.idle_timeout,
                buffer_size: DEFAULT_BUFFER_SIZE,
            },
            max_connections: self.max_connections,
            accept_retry_delay: DEFAULT_ACCEPT_RETRY_DELAY,
        }
    }
}
