//! Configuration management for the taskswarm manager.
//!
//! All runtime tunables live in [`ManagerConfig`], grouped into sections
//! mirroring the TOML layout. Values load from an optional configuration
//! file plus `TASKSWARM_*` environment overrides, pass a validation step,
//! and may still be adjusted at runtime through
//! [`crate::Manager::tune`].
//!
//! # Examples
//!
//! ```rust
//! use taskswarm::config::ManagerConfig;
//!
//! let config = ManagerConfig::default();
//! assert_eq!(config.timeouts.short_timeout, 5);
//! assert_eq!(config.scheduler.policy, "fcfs");
//! ```
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub mod service;
pub mod validation;

pub use service::{load_config, load_config_from};

/// Full manager configuration.
///
/// # Serialization
///
/// This struct can be serialized to/from TOML format for configuration
/// files.
///
/// ```rust
/// use taskswarm::config::ManagerConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ManagerConfig::default();
/// let toml_str = toml::to_string(&config)?;
/// assert!(toml_str.contains("[timeouts]"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ManagerConfig {
    /// Identity, listening port, and catalog settings.
    pub manager: ManagerSection,
    /// Network deadlines and bandwidth assumptions.
    pub timeouts: TimeoutsSection,
    /// Worker-selection policy and overcommit settings.
    pub scheduler: SchedulerSection,
    /// Slow-task and slow-worker detection.
    pub fast_abort: FastAbortSection,
    /// Optional persisted logs.
    pub logs: LogsSection,
    /// Optional file path from which the configuration was loaded.
    #[serde(skip)]
    pub loaded_from: Option<PathBuf>,
}

/// Manager identity and listening configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagerSection {
    /// TCP port workers connect to; 0 picks an ephemeral port.
    pub port: u16,
    /// Project name advertised to the catalog. No advertisement when unset.
    pub name: Option<String>,
    /// Manager priority advertised to the catalog.
    pub priority: i64,
    /// File holding the shared password workers must prove they know.
    pub password_file: Option<PathBuf>,
    /// Comma-separated catalog hosts.
    pub catalog_hosts: String,
    /// Seconds between catalog advertisements.
    pub catalog_update_interval: u64,
    /// PEM private key enabling TLS on worker connections.
    pub ssl_key: Option<PathBuf>,
    /// PEM certificate chain paired with `ssl_key`.
    pub ssl_cert: Option<PathBuf>,
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            port: 9123,
            name: None,
            priority: 0,
            password_file: None,
            catalog_hosts: "localhost:9097".to_string(),
            catalog_update_interval: 60,
            ssl_key: None,
            ssl_cert: None,
        }
    }
}

/// Network deadlines and the bandwidth model behind transfer timeouts.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TimeoutsSection {
    /// Seconds for short control exchanges.
    pub short_timeout: u64,
    /// Seconds for long administrative reads.
    pub long_timeout: u64,
    /// Seconds between keepalive checks to a quiet worker.
    pub keepalive_interval: u64,
    /// Seconds a worker may ignore a keepalive check before removal.
    pub keepalive_timeout: u64,
    /// Floor for any bulk transfer deadline, seconds.
    pub minimum_transfer_timeout: u64,
    /// Tolerate transfers this many times slower than the estimate.
    pub transfer_outlier_factor: f64,
    /// Conservative bandwidth assumption when no history exists, bytes/sec.
    pub default_transfer_rate: f64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            short_timeout: 5,
            long_timeout: 3600,
            keepalive_interval: 120,
            keepalive_timeout: 30,
            minimum_transfer_timeout: 10,
            transfer_outlier_factor: 10.0,
            default_transfer_rate: 1_000_000.0,
        }
    }
}

/// Worker-selection policy and resource overcommit settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SchedulerSection {
    /// One of `fcfs`, `files`, `time`, `worst-fit`, `random`.
    pub policy: String,
    /// Overcommit factor for cores/memory/gpus. Disk never overcommits.
    pub resource_submit_multiplier: f64,
    /// Scale task boxes so an integer number tile each worker.
    pub force_proportional_resources: bool,
    /// Ready tasks below which the queue reports itself hungry.
    pub hungry_minimum: i64,
    /// Hold dispatch until this many workers are connected.
    pub wait_for_workers: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            policy: "fcfs".to_string(),
            resource_submit_multiplier: 1.0,
            force_proportional_resources: false,
            hungry_minimum: 10,
            wait_for_workers: 0,
        }
    }
}

/// Fast-abort tuning.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FastAbortSection {
    /// Default multiplier for the `default` category: negative disables,
    /// positive kills tasks running longer than multiplier * category
    /// average.
    pub multiplier: f64,
    /// Seconds a repeatedly slow worker's host stays blocked.
    pub slow_worker_blocklist_timeout: u64,
}

impl Default for FastAbortSection {
    fn default() -> Self {
        Self {
            multiplier: -1.0,
            slow_worker_blocklist_timeout: 900,
        }
    }
}

/// Optional persisted logs.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct LogsSection {
    /// Performance snapshots, one line per second of activity.
    pub stats_log: Option<PathBuf>,
    /// Per-transition transaction log.
    pub transaction_log: Option<PathBuf>,
}

impl ManagerConfig {
    /// Read the shared password, when a password file is configured.
    pub fn read_password(&self) -> crate::Result<Option<String>> {
        match &self.manager.password_file {
            None => Ok(None),
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(Some(text.trim_end_matches(['\r', '\n']).to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let c = ManagerConfig::default();
        assert_eq!(c.manager.port, 9123);
        assert_eq!(c.timeouts.keepalive_interval, 120);
        assert_eq!(c.scheduler.resource_submit_multiplier, 1.0);
        assert!(c.fast_abort.multiplier < 0.0);
        assert!(c.logs.stats_log.is_none());
    }

    #[test]
    fn test_toml_round_trip() {
        let c = ManagerConfig::default();
        let text = toml::to_string(&c).unwrap();
        let back: ManagerConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.manager.port, c.manager.port);
        assert_eq!(back.scheduler.policy, c.scheduler.policy);
    }

    #[test]
    fn test_read_password_trims_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pw");
        std::fs::write(&path, "hunter2\n").unwrap();
        let mut c = ManagerConfig::default();
        c.manager.password_file = Some(path);
        assert_eq!(c.read_password().unwrap().as_deref(), Some("hunter2"));
    }
}
