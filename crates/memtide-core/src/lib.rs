//! memtide-core — inventory types and controller configuration shared by
//! every memtide crate.

pub mod config;
pub mod types;

pub use config::{ConfigError, ControllerConfig, PlatformConfig, ProvisionerConfig, StateConfig};
pub use types::*;
