//! Configuration handling for the stream client binary.
//!
//! Settings come from an optional YAML file, then `STREAM_*` environment
//! variables, then explicit command line flags, each layer overriding the
//! previous one.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use stream_session::{config, ClientOption};
use tracing::{info, warn};

/// Client settings as read from the config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Target host
    pub host: Option<String>,
    /// Target port
    pub port: Option<u16>,
    /// Connect timeout, e.g. "30s"
    pub connect_timeout: Option<String>,
    /// Request timeout, e.g. "15s"
    pub request_timeout: Option<String>,
    /// Heartbeat interval, e.g. "4m"
    pub heartbeat_interval: Option<String>,
    /// Frame timeout, e.g. "5s"
    pub frame_timeout: Option<String>,
    /// Maximum pending requests
    pub max_concurrent: Option<usize>,
    /// Maximum encoded request size in bytes
    pub max_bytes: Option<usize>,
    /// TLS configuration
    pub tls: TlsConfig,
}

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to CA certificate file
    pub ca_file: Option<PathBuf>,
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    client: Option<CliConfig>,
}

impl CliConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.client.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `STREAM_HOST`, `STREAM_PORT` and `STREAM_REQUEST_TIMEOUT`
    fn apply_environment_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(host) = lookup("STREAM_HOST") {
            info!("Host overridden by environment: {}", host);
            self.host = Some(host);
        }

        if let Some(port) = lookup("STREAM_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    info!("Port overridden by environment: {}", port);
                    self.port = Some(port);
                }
                Err(_) => warn!("Ignoring invalid STREAM_PORT {:?}", port),
            }
        }

        if let Some(timeout) = lookup("STREAM_REQUEST_TIMEOUT") {
            info!("Request timeout overridden by environment: {}", timeout);
            self.request_timeout = Some(timeout);
        }
    }

    /// Turn the settings into session options, in a fixed order
    pub fn to_options(&self) -> Result<Vec<ClientOption>> {
        let mut options = Vec::new();

        if let Some(host) = &self.host {
            options.push(config::host(host.clone()));
        }
        if let Some(port) = self.port {
            options.push(config::port(port));
        }
        if let Some(d) = parse_duration("connect_timeout", &self.connect_timeout)? {
            options.push(config::connect_timeout(d));
        }
        if let Some(d) = parse_duration("request_timeout", &self.request_timeout)? {
            options.push(config::request_timeout(d));
        }
        if let Some(d) = parse_duration("heartbeat_interval", &self.heartbeat_interval)? {
            options.push(config::heartbeat_interval(d));
        }
        if let Some(d) = parse_duration("frame_timeout", &self.frame_timeout)? {
            options.push(config::frame_timeout(d));
        }
        if let Some(n) = self.max_concurrent {
            options.push(config::max_concurrent(n));
        }
        if let Some(n) = self.max_bytes {
            options.push(config::max_bytes(n));
        }

        Ok(options)
    }
}

fn parse_duration(name: &str, value: &Option<String>) -> Result<Option<Duration>> {
    value
        .as_deref()
        .map(|raw| {
            humantime::parse_duration(raw).with_context(|| format!("invalid {}: {:?}", name, raw))
        })
        .transpose()
}
