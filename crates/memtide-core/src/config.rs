//! memtide.toml configuration parser.
//!
//! Every option has a default, so an empty file yields a working
//! (dry-run) configuration. Durations are written as `"500ms"`, `"10s"`,
//! `"5m"`, `"1h"` or a bare number of seconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::UserId;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Target free-memory percentage.
    pub overcommit_ratio: f64,
    /// Tolerance around `overcommit_ratio` before a VM is resized.
    pub overcommit_margin: f64,
    /// Minimum time between two resizes of the same VM.
    #[serde(with = "duration_str")]
    pub cooldown: Duration,
    /// Minimum time between two evictions from the same host.
    #[serde(with = "duration_str")]
    pub migration_cooldown: Duration,
    /// Sleep between scheduling cycles.
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Absolute floor for any VM's memory (KiB).
    pub min_memory: u64,
    /// Smallest change worth applying (KiB).
    pub change_threshold: u64,
    /// Free memory at or below which starvation backoff kicks in (KiB).
    pub min_free_memory: u64,
    /// Free memory a host must keep after growing a VM (KiB).
    pub host_memory_margin: u64,
    /// Memory reserved by the guest OS, subtracted from reported free memory (KiB).
    pub system_memory_offset: u64,
    /// Parallel VM evaluations per cycle.
    pub workers: usize,
    /// Log resize and migrate operations instead of performing them.
    pub dry_run: bool,
    /// Only monitor VMs owned by this user.
    pub user_filter: Option<UserId>,
    /// Upper bound for a single platform call.
    #[serde(with = "duration_str")]
    pub gateway_timeout: Duration,
    pub platform: PlatformConfig,
    pub provisioner: ProvisionerConfig,
    pub state: StateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// Name of the platform backend, resolved at startup.
    pub backend: String,
    /// JSON inventory read by the `inventory` backend.
    pub inventory_path: PathBuf,
    /// Command that changes a running VM's memory.
    /// Placeholders: `{hostname}`, `{vmid}`, `{newmemory}`.
    pub resize_command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Name of the capacity provisioner backend; `none` disables provisioning.
    pub backend: String,
    /// Overall deadline for a capacity request to be served.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// Sleep between two polls of a pending request.
    #[serde(with = "duration_str")]
    pub poll_delay: Duration,
    /// Timeout handed to each individual poll.
    #[serde(with = "duration_str")]
    pub poll_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// redb file holding the controller state.
    pub path: PathBuf,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            overcommit_ratio: 30.0,
            overcommit_margin: 5.0,
            cooldown: Duration::from_secs(10),
            migration_cooldown: Duration::from_secs(45),
            interval: Duration::from_secs(5),
            min_memory: 262_144,
            change_threshold: 1024,
            min_free_memory: 20_000,
            host_memory_margin: 102_400,
            system_memory_offset: 80_000,
            workers: 1,
            dry_run: true,
            user_filter: None,
            gateway_timeout: Duration::from_secs(10),
            platform: PlatformConfig::default(),
            provisioner: ProvisionerConfig::default(),
            state: StateConfig::default(),
        }
    }
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            backend: "inventory".to_string(),
            inventory_path: PathBuf::from("inventory.json"),
            resize_command: "virsh -c 'qemu+ssh://{hostname}/system' setmem one-{vmid} {newmemory}"
                .to_string(),
        }
    }
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            backend: "none".to_string(),
            request_timeout: Duration::from_secs(300),
            poll_delay: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(1),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("memtide.redb"),
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ControllerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    /// Reject values the sizing formula cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.overcommit_ratio > 0.0 && self.overcommit_ratio < 100.0) {
            return Err(ConfigError::Invalid(format!(
                "overcommit_ratio must be within (0, 100), got {}",
                self.overcommit_ratio
            )));
        }
        if self.overcommit_margin < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "overcommit_margin must not be negative, got {}",
                self.overcommit_margin
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Parse a duration string like "500ms", "30s", "5m", "1h" or "30".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<f64>().ok().and_then(secs_f64)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<f64>().ok().and_then(secs_f64)
    }
}

fn secs_f64(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        if d.subsec_millis() == 0 {
            s.serialize_str(&format!("{}s", d.as_secs()))
        } else {
            s.serialize_str(&format!("{}ms", d.as_millis()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Secs(f64),
        }

        match Raw::deserialize(d)? {
            Raw::Text(text) => super::parse_duration(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {text:?}"))),
            Raw::Secs(secs) => Duration::try_from_secs_f64(secs)
                .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        }
    }
}
