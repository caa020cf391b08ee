//! Host capability probe and option conflict check.
//!
//! Both run before any interface exists. Missing kernel support and
//! incompatible options are facts the daemon acts on, not errors.

use std::path::Path;
use tracing::{debug, info};

use shared_utils::config::{Config, InstanceMode, OffloadMode, Topology};

use crate::error::DcoError;
use crate::types::DcoCipher;

/// Read-only view of the options that decide whether offload can run.
pub trait ConfigurationReader {
    fn offload_mode(&self) -> OffloadMode;
    fn instance_mode(&self) -> InstanceMode;
    fn dev_type(&self) -> &str;
    fn topology(&self) -> Topology;
    fn fragment(&self) -> Option<u32>;
    fn compression(&self) -> bool;
    fn shaper(&self) -> Option<u32>;
    fn socks_proxy(&self) -> Option<&str>;
    fn http_proxy(&self) -> Option<&str>;
    fn data_ciphers(&self) -> &[String];
}

impl ConfigurationReader for Config {
    fn offload_mode(&self) -> OffloadMode {
        self.dco.offload
    }

    fn instance_mode(&self) -> InstanceMode {
        self.tunnel.mode
    }

    fn dev_type(&self) -> &str {
        &self.tunnel.dev_type
    }

    fn topology(&self) -> Topology {
        self.tunnel.topology
    }

    fn fragment(&self) -> Option<u32> {
        self.tunnel.fragment
    }

    fn compression(&self) -> bool {
        self.tunnel.compression
    }

    fn shaper(&self) -> Option<u32> {
        self.tunnel.shaper
    }

    fn socks_proxy(&self) -> Option<&str> {
        self.tunnel.socks_proxy.as_deref()
    }

    fn http_proxy(&self) -> Option<&str> {
        self.tunnel.http_proxy.as_deref()
    }

    fn data_ciphers(&self) -> &[String] {
        &self.tunnel.data_ciphers
    }
}

/// What the caller should do about a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictSeverity {
    /// Run without offload
    Fallback,
    /// Offload was required; refuse to start
    Abort,
}

/// First option found to be incompatible with offload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub option: String,
    pub message: String,
    pub severity: ConflictSeverity,
}

impl ConflictReport {
    pub fn into_error(self) -> DcoError {
        DcoError::ConfigConflict {
            option: self.option,
        }
    }
}

/// Whether the kernel offload module is present.
///
/// Checks for any of `module_paths`; touches nothing and never blocks on
/// anything slower than a metadata lookup.
pub fn probe_availability<P: AsRef<Path>>(module_paths: &[P]) -> bool {
    let found = module_paths
        .iter()
        .find(|p| std::fs::metadata(p.as_ref()).is_ok());
    match found {
        Some(path) => {
            debug!(path = %path.as_ref().display(), "Offload module present");
            true
        }
        None => {
            info!("Offload module not found, data channel stays in user space");
            false
        }
    }
}

/// Scan options in a fixed order and report the first conflict.
pub fn check_conflicts(config: &dyn ConfigurationReader) -> Option<ConflictReport> {
    let severity = match config.offload_mode() {
        OffloadMode::Required => ConflictSeverity::Abort,
        OffloadMode::Auto | OffloadMode::Disabled => ConflictSeverity::Fallback,
    };
    let report = |option: &str, message: String| {
        debug!(option, %message, "Offload conflict");
        Some(ConflictReport {
            option: option.to_string(),
            message,
            severity,
        })
    };

    if config.dev_type() != "tun" {
        return report(
            "dev_type",
            format!("device type '{}' is not supported", config.dev_type()),
        );
    }
    if let Some(size) = config.fragment() {
        return report("fragment", format!("fragment {size} is not supported"));
    }
    if config.socks_proxy().is_some() {
        return report("socks_proxy", "SOCKS proxy is not supported".to_string());
    }
    if config.http_proxy().is_some() {
        return report("http_proxy", "HTTP proxy is not supported".to_string());
    }
    if let Some(rate) = config.shaper() {
        return report("shaper", format!("shaper {rate} is not supported"));
    }
    if config.instance_mode() == InstanceMode::Server && config.topology() != Topology::Subnet {
        return report(
            "topology",
            "server mode requires topology subnet".to_string(),
        );
    }
    if config.compression() {
        return report("compression", "compression is not supported".to_string());
    }
    if let Some(cipher) = config
        .data_ciphers()
        .iter()
        .find(|c| DcoCipher::from_name(c).is_none())
    {
        return report(
            "data_ciphers",
            format!("cipher '{cipher}' cannot be offloaded"),
        );
    }
    None
}
