// src/config.rs
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::rabbitmq::retry::{Backoff, RetryPolicy};

pub const CONFIG_FILE_NAME: &str = "rabbit_bus.json";

// Configuration structures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Shows up as the connection name in the broker management UI
    pub client_name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    #[serde(default = "default_timeout")]
    pub connection_timeout_ms: u64,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_seconds: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM bundle used instead of the system roots
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_check_period")]
    pub connection_check_period_ms: u64,
    #[serde(default = "default_prefetch")]
    pub prefetch_count: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    /// `None` publishes with a single attempt
    #[serde(default = "default_retry_count")]
    pub retry_count: Option<u32>,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
}

// Default values
fn default_port() -> u16 { 5672 }
fn default_virtual_host() -> String { "/".to_string() }
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 30 }
fn default_startup_delay() -> u64 { 3000 }
fn default_check_period() -> u64 { 2000 }
fn default_prefetch() -> u16 { 10 }
fn default_retry_count() -> Option<u32> { Some(5) }
fn default_retry_base_delay() -> u64 { 100 }

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay(),
            connection_check_period_ms: default_check_period(),
            prefetch_count: default_prefetch(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            retry_count: default_retry_count(),
            retry_base_delay_ms: default_retry_base_delay(),
        }
    }
}

impl ConnectionConfig {
    pub fn new(client_name: &str, host: &str, user: &str, password: &str) -> Self {
        Self {
            client_name: client_name.to_string(),
            host: host.to_string(),
            port: default_port(),
            user: user.to_string(),
            password: password.to_string(),
            virtual_host: default_virtual_host(),
            tls: None,
            connection_timeout_ms: default_timeout(),
            heartbeat_seconds: default_heartbeat(),
        }
    }

    pub fn with_virtual_host(mut self, virtual_host: &str) -> Self {
        self.virtual_host = virtual_host.to_string();
        self
    }

    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_name.trim().is_empty() {
            return Err(anyhow!("Configuration error: connection.client_name cannot be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("Configuration error: connection.host cannot be empty"));
        }
        if self.user.is_empty() {
            return Err(anyhow!("Configuration error: connection.user cannot be empty"));
        }
        Ok(())
    }
}

// The password never ends up in logs
impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("client_name", &self.client_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("virtual_host", &self.virtual_host)
            .field("tls", &self.tls)
            .field("connection_timeout_ms", &self.connection_timeout_ms)
            .field("heartbeat_seconds", &self.heartbeat_seconds)
            .finish()
    }
}

impl PublisherConfig {
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.retry_count.map(|retries| {
            RetryPolicy::bounded(
                retries,
                Backoff::exponential(Duration::from_millis(self.retry_base_delay_ms)),
            )
        })
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let config_dir_file = Path::new("config").join(CONFIG_FILE_NAME);
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", config_dir_file),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.clone());
        }
    }

    // Try the user's home directory
    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} in the current directory, config/ or the home directory",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config(path: &Path) -> Result<BusConfig> {
    let config_content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;

    let config: BusConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON or missing required fields")?;

    config.connection.validate()?;
    Ok(config)
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let default_config = BusConfig {
        connection: ConnectionConfig::new("rabbit_bus", "localhost", "guest", "guest"),
        consumer: ConsumerConfig::default(),
        publisher: PublisherConfig::default(),
    };

    let json = serde_json::to_string_pretty(&default_config)
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}

/// Loads `path`, writing the default configuration there first when the
/// file does not exist yet. An existing file is never overwritten.
pub fn load_or_create_config(path: &Path) -> Result<BusConfig> {
    if !path.exists() {
        warn!("No configuration at {}, writing defaults", path.display());
        create_default_config_file(path)?;
    }
    load_config(path)
}
