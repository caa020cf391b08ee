//! Configuration management module for the CoentroVPN offload daemon.
//!
//! This module provides functionality for loading, parsing, and managing
//! the settings that drive data channel offload: where the kernel control
//! node lives, how offload is selected, and the tunnel options that decide
//! whether offload can be used at all.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::proto::framing::MAX_PAYLOAD_SIZE;

/// Metric installed on routes that point at an offloaded interface.
pub const DEFAULT_ROUTE_METRIC: u32 = 200;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] io::Error),

    /// Error parsing TOML configuration
    #[error("Failed to parse TOML config: {0}")]
    TomlError(#[from] toml::de::Error),

    /// Error serializing configuration to TOML
    #[error("Failed to serialize config to TOML: {0}")]
    TomlSerError(#[from] toml::ser::Error),

    /// Missing required configuration value
    #[error("Missing required configuration value: {0}")]
    MissingValue(String),

    /// Invalid configuration value
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration file not found
    #[error("Configuration file not found at {0}")]
    FileNotFound(PathBuf),
}

/// How the daemon should treat data channel offload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffloadMode {
    /// Use offload when the host supports it and the options allow it
    #[default]
    Auto,
    /// Never use offload
    Disabled,
    /// Refuse to start without offload
    Required,
}

/// Operating mode of the tunnel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceMode {
    /// One remote peer
    #[default]
    PointToPoint,
    /// Server instance multiplexing many peers
    Server,
}

/// Address topology for server instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Net30,
    P2p,
    #[default]
    Subnet,
}

/// Kernel offload settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DcoConfig {
    /// Offload selection policy (default: auto)
    #[serde(default)]
    pub offload: OffloadMode,

    /// Character device or socket carrying the control channel
    #[serde(default = "default_control_node")]
    pub control_node: String,

    /// Paths whose presence indicates the kernel module is loaded
    #[serde(default = "default_module_paths")]
    pub module_paths: Vec<String>,

    /// Metric for routes over the offloaded interface (default: 200)
    #[serde(default = "default_route_metric")]
    pub route_metric: u32,

    /// Largest control payload accepted from the kernel
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
}

fn default_control_node() -> String {
    "/dev/net/ovpn-dco".to_string()
}

fn default_module_paths() -> Vec<String> {
    vec![
        "/sys/module/ovpn_dco_v2".to_string(),
        "/sys/module/ovpn".to_string(),
    ]
}

fn default_route_metric() -> u32 {
    DEFAULT_ROUTE_METRIC
}

fn default_max_payload() -> usize {
    MAX_PAYLOAD_SIZE
}

impl Default for DcoConfig {
    fn default() -> Self {
        DcoConfig {
            offload: OffloadMode::default(),
            control_node: default_control_node(),
            module_paths: default_module_paths(),
            route_metric: default_route_metric(),
            max_payload: default_max_payload(),
        }
    }
}

/// Tunnel options that interact with offload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunnelOptions {
    /// Instance mode (default: point-to-point)
    #[serde(default)]
    pub mode: InstanceMode,

    /// Device type: "tun" or "tap" (default: "tun")
    #[serde(default = "default_dev_type")]
    pub dev_type: String,

    /// Server topology (default: subnet)
    #[serde(default)]
    pub topology: Topology,

    /// Internal fragmentation size, if enabled
    #[serde(default)]
    pub fragment: Option<u32>,

    /// Per-packet compression
    #[serde(default)]
    pub compression: bool,

    /// Traffic shaper rate in bytes per second
    #[serde(default)]
    pub shaper: Option<u32>,

    /// SOCKS proxy endpoint
    #[serde(default)]
    pub socks_proxy: Option<String>,

    /// HTTP proxy endpoint
    #[serde(default)]
    pub http_proxy: Option<String>,

    /// Data channel ciphers negotiable with peers, in preference order
    #[serde(default = "default_data_ciphers")]
    pub data_ciphers: Vec<String>,
}

fn default_dev_type() -> String {
    "tun".to_string()
}

fn default_data_ciphers() -> Vec<String> {
    vec![
        "AES-256-GCM".to_string(),
        "AES-128-GCM".to_string(),
        "CHACHA20-POLY1305".to_string(),
    ]
}

impl Default for TunnelOptions {
    fn default() -> Self {
        TunnelOptions {
            mode: InstanceMode::default(),
            dev_type: default_dev_type(),
            topology: Topology::default(),
            fragment: None,
            compression: false,
            shaper: None,
            socks_proxy: None,
            http_proxy: None,
            data_ciphers: default_data_ciphers(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Log level (default: "info")
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines instead of text
    #[serde(default)]
    pub log_json: bool,

    /// Kernel offload settings
    #[serde(default)]
    pub dco: DcoConfig,

    /// Tunnel options checked against offload constraints
    #[serde(default)]
    pub tunnel: TunnelOptions,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            log_json: false,
            dco: DcoConfig::default(),
            tunnel: TunnelOptions::default(),
        }
    }
}

impl Config {
    /// Create a new default configuration
    pub fn new() -> Self {
        Config::default()
    }

    /// Load configuration from a TOML file, then apply `COENTRO_DCO_*`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.validate()?;

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dco.control_node.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "dco.control_node".to_string(),
                message: "control node path cannot be empty".to_string(),
            });
        }

        if self.dco.max_payload == 0 || self.dco.max_payload > MAX_PAYLOAD_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "dco.max_payload".to_string(),
                message: format!("must be between 1 and {}", MAX_PAYLOAD_SIZE),
            });
        }

        if self.tunnel.dev_type.trim().is_empty() {
            return Err(ConfigError::MissingValue("tunnel.dev_type".to_string()));
        }

        if self.tunnel.data_ciphers.is_empty() {
            return Err(ConfigError::MissingValue(
                "tunnel.data_ciphers must list at least one cipher".to_string(),
            ));
        }

        if self.tunnel.fragment == Some(0) {
            return Err(ConfigError::InvalidValue {
                key: "tunnel.fragment".to_string(),
                message: "must be greater than 0 when set".to_string(),
            });
        }

        Ok(())
    }

    /// Apply overrides from a key lookup (prefix: COENTRO_DCO_).
    ///
    /// Keys: COENTRO_DCO_LOG_LEVEL, COENTRO_DCO_LOG_JSON, COENTRO_DCO_OFFLOAD,
    /// COENTRO_DCO_CONTROL_NODE, COENTRO_DCO_ROUTE_METRIC, COENTRO_DCO_MODE,
    /// COENTRO_DCO_COMPRESSION, COENTRO_DCO_DATA_CIPHERS
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse_bool(s: &str) -> Option<bool> {
            match s.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "y" | "on" => Some(true),
                "false" | "0" | "no" | "n" | "off" => Some(false),
                _ => None,
            }
        }
        fn split_csv(s: &str) -> Vec<String> {
            s.split(',')
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .collect()
        }

        if let Some(v) = lookup("COENTRO_DCO_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(b) = lookup("COENTRO_DCO_LOG_JSON").as_deref().and_then(parse_bool) {
            self.log_json = b;
        }
        if let Some(v) = lookup("COENTRO_DCO_OFFLOAD") {
            self.dco.offload = match v.to_ascii_lowercase().as_str() {
                "auto" => OffloadMode::Auto,
                "disabled" | "off" => OffloadMode::Disabled,
                "required" => OffloadMode::Required,
                _ => self.dco.offload,
            };
        }
        if let Some(v) = lookup("COENTRO_DCO_CONTROL_NODE") {
            if !v.is_empty() {
                self.dco.control_node = v;
            }
        }
        if let Some(n) = lookup("COENTRO_DCO_ROUTE_METRIC").and_then(|v| v.parse().ok()) {
            self.dco.route_metric = n;
        }
        if let Some(v) = lookup("COENTRO_DCO_MODE") {
            self.tunnel.mode = match v.to_ascii_lowercase().as_str() {
                "server" => InstanceMode::Server,
                "point-to-point" | "p2p" => InstanceMode::PointToPoint,
                _ => self.tunnel.mode,
            };
        }
        if let Some(b) = lookup("COENTRO_DCO_COMPRESSION")
            .as_deref()
            .and_then(parse_bool)
        {
            self.tunnel.compression = b;
        }
        if let Some(v) = lookup("COENTRO_DCO_DATA_CIPHERS") {
            let ciphers = split_csv(&v);
            if !ciphers.is_empty() {
                self.tunnel.data_ciphers = ciphers;
            }
        }
    }

    /// Reload configuration from the same file it was loaded from
    pub fn reload(&mut self, path: &Path) -> Result<(), ConfigError> {
        *self = Self::load(path)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("coentrovpn").join("dco.toml")
        } else {
            PathBuf::from("dco.toml")
        }
    }
}

/// Configuration manager for handling configuration loading and reloading.
#[derive(Debug)]
pub struct ConfigManager {
    config: Config,
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new configuration manager with the default configuration
    pub fn new() -> Self {
        ConfigManager {
            config: Config::default(),
            config_path: Config::default_path(),
        }
    }

    /// Load configuration from the specified path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref().to_path_buf();
        let config = Config::load(&path)?;

        Ok(ConfigManager {
            config,
            config_path: path,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Reload configuration from the current path
    pub fn reload(&mut self) -> Result<(), ConfigError> {
        self.config.reload(&self.config_path)
    }

    /// Save the current configuration to the current path
    pub fn save(&self) -> Result<(), ConfigError> {
        self.config.save(&self.config_path)
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
