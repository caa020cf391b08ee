//! Shared utilities for the CoentroVPN offload components.
//!
//! This crate provides the pieces the offload control layer shares with the
//! rest of the daemon: configuration loading, logging setup, and the control
//! channel wire codec.

pub mod config;
pub mod logging;
pub mod proto;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigError, ConfigManager, OffloadMode};
pub use proto::framing;
