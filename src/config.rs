//! Configuration parsing and management

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rules::{ProxyTarget, RuleSet};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Root identity storage
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Side-effect dispatch limits
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Intercepted hosts
    #[serde(default)]
    pub targets: Vec<ProxyTarget>,
}

/// Which CONNECT tunnels get TLS-terminated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InterceptMode {
    /// Only hosts named by a target. Everything else is relayed opaquely.
    #[default]
    Targets,
    /// Every tunnel.
    All,
}

/// Proxy-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Address of the intercepting proxy listener
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Address of the plain CA certificate download listener
    #[serde(default = "default_certificate_address")]
    pub certificate_address: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Bound on receiving the CONNECT request head
    #[serde(default = "default_head_timeout_secs")]
    pub head_timeout_secs: u64,

    /// Cap on each captured request or response body
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default)]
    pub intercept: InterceptMode,

    /// Path to PEM CA cert to trust for upstream TLS (testing only)
    #[serde(default)]
    pub upstream_tls_ca: Option<String>,

    /// Override upstream port for all CONNECT forwards (testing only)
    #[serde(default)]
    pub upstream_override_port: Option<u16>,

    /// Override upstream host for all CONNECT forwards (testing only)
    #[serde(default)]
    pub upstream_override_host: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            certificate_address: default_certificate_address(),
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            head_timeout_secs: default_head_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
            intercept: InterceptMode::default(),
            upstream_tls_ca: None,
            upstream_override_port: None,
            upstream_override_host: None,
        }
    }
}

impl ProxyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn head_timeout(&self) -> Duration {
        Duration::from_secs(self.head_timeout_secs)
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:16836".to_string()
}

fn default_certificate_address() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_head_timeout_secs() -> u64 {
    10
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

/// Where the root key and certificate live.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Directory for the file store. Defaults to the platform data directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSONL file receiving captured exchanges. Without it captures are only logged.
    #[serde(default)]
    pub capture_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            capture_log: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_concurrency() -> usize {
    4
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::config(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        parse_address("bind_address", &self.proxy.bind_address)?;
        parse_address("certificate_address", &self.proxy.certificate_address)?;

        if self.proxy.connect_timeout_secs == 0 {
            return Err(Error::config("`connect_timeout_secs` must be greater than 0"));
        }
        if self.proxy.handshake_timeout_secs == 0 {
            return Err(Error::config("`handshake_timeout_secs` must be greater than 0"));
        }
        if self.proxy.head_timeout_secs == 0 {
            return Err(Error::config("`head_timeout_secs` must be greater than 0"));
        }
        if self.dispatch.queue_capacity == 0 {
            return Err(Error::config("`dispatch.queue_capacity` must be greater than 0"));
        }
        if self.dispatch.max_concurrency == 0 {
            return Err(Error::config("`dispatch.max_concurrency` must be greater than 0"));
        }

        self.rule_set().map(|_| ())
    }

    /// The validated target rules
    pub fn rule_set(&self) -> Result<RuleSet> {
        RuleSet::new(self.targets.clone())
    }

    pub fn bind_address(&self) -> Result<SocketAddr> {
        parse_address("bind_address", &self.proxy.bind_address)
    }

    pub fn certificate_address(&self) -> Result<SocketAddr> {
        parse_address("certificate_address", &self.proxy.certificate_address)
    }

    /// Create a minimal configuration with just the essentials
    pub fn minimal(bind_address: String, certificate_address: String) -> Self {
        Self {
            proxy: ProxyConfig {
                bind_address,
                certificate_address,
                ..ProxyConfig::default()
            },
            ..Self::default()
        }
    }
}

fn parse_address(field: &str, value: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| Error::config(format!("Invalid {} '{}': {}", field, value, e)))
}
