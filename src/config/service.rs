//! Configuration loading: defaults, optional TOML file, environment
//! overrides, and the validation pass.
use crate::config::{validation, ManagerConfig};
use crate::{Result, error::SwarmError};
use config::{Config as ConfigCrate, Environment, File};
use log::debug;
use std::path::{Path, PathBuf};

/// Default configuration file location: `~/.config/taskswarm/manager.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("taskswarm").join("manager.toml"))
}

/// Load the manager configuration.
///
/// Layering, last wins: built-in defaults, then the default configuration
/// file when present, then `TASKSWARM_*` environment variables with `__`
/// between section and field (`TASKSWARM_MANAGER__PORT`,
/// `TASKSWARM_TIMEOUTS__SHORT_TIMEOUT`, ...).
pub fn load_config() -> Result<ManagerConfig> {
    load_config_from(default_config_path().as_deref())
}

/// Load configuration from an explicit file (or just defaults plus
/// environment when `None` or the file does not exist).
pub fn load_config_from(path: Option<&Path>) -> Result<ManagerConfig> {
    let defaults = ManagerConfig::default();
    let mut builder = ConfigCrate::builder().add_source(ConfigCrate::try_from(&defaults)?);

    let mut loaded_from = None;
    if let Some(path) = path {
        if path.exists() {
            debug!("loading configuration from {}", path.display());
            builder = builder.add_source(File::from(path));
            loaded_from = Some(path.to_path_buf());
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("TASKSWARM")
            .separator("__")
            .try_parsing(true),
    );

    let mut config: ManagerConfig = builder.build()?.try_deserialize()?;
    config.loaded_from = loaded_from;

    validation::validate_config(&config).map_err(SwarmError::config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_defaults_without_file() {
        let config = load_config_from(None).unwrap();
        assert_eq!(config.timeouts.short_timeout, 5);
        assert!(config.loaded_from.is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(
            &path,
            "[manager]\nport = 4000\n\n[scheduler]\npolicy = \"files\"\n",
        )
        .unwrap();

        let config = load_config_from(Some(&path)).unwrap();
        assert_eq!(config.manager.port, 4000);
        assert_eq!(config.scheduler.policy, "files");
        // untouched sections keep their defaults
        assert_eq!(config.timeouts.keepalive_timeout, 30);
        assert_eq!(config.loaded_from.as_deref(), Some(path.as_path()));
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manager.toml");
        std::fs::write(&path, "[scheduler]\npolicy = \"fastest\"\n").unwrap();
        let err = load_config_from(Some(&path)).unwrap_err();
        assert!(matches!(err, SwarmError::Config { .. }));
    }
}
