use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use crate::entity::Entity;
use crate::error::Error;
use crate::general::General;
use crate::sharding::Sharding;
use crate::storage::Storage;

/// Top-level `shardkeep.toml` configuration, plus the path it was loaded
/// from.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub config: Config,
    pub path: PathBuf,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            config: Config::default(),
            path: PathBuf::from("shardkeep.toml"),
        }
    }
}

impl ConfigFile {
    /// Load configuration from disk, falling back to defaults if the file
    /// doesn't exist.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let config = if let Ok(raw) = read_to_string(path) {
            let config: Config = toml::from_str(&raw)
                .map_err(|err| Error::config(&path.display().to_string(), err))?;
            tracing::info!("loaded \"{}\"", path.display());
            config
        } else {
            tracing::warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Config::default()
        };

        config.check();

        Ok(ConfigFile {
            config,
            path: path.to_owned(),
        })
    }
}

/// Configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub sharding: Sharding,

    #[serde(default)]
    pub entity: Entity,

    #[serde(default)]
    pub storage: Storage,
}

impl Config {
    /// Warn about configuration combinations that are legal but likely
    /// misconfigured.
    pub fn check(&self) {
        use crate::storage::Backend;

        if self.storage.backend == Backend::Sql && self.storage.database_url.is_none() {
            tracing::warn!("storage.backend is \"sql\" but no database_url was configured");
        }

        if self.sharding.shard_lock_refresh_interval >= self.sharding.shard_lock_expiration {
            tracing::warn!(
                "shard_lock_refresh_interval ({}ms) should be shorter than shard_lock_expiration ({}ms)",
                self.sharding.shard_lock_refresh_interval,
                self.sharding.shard_lock_expiration
            );
        }

        if self.sharding.shard_lock_ttl >= self.sharding.shard_lock_expiration {
            tracing::warn!(
                "shard_lock_ttl ({}ms) should be shorter than shard_lock_expiration ({}ms)",
                self.sharding.shard_lock_ttl,
                self.sharding.shard_lock_expiration
            );
        }
    }

    /// This process acts as the shard manager, i.e. it was not pointed at
    /// a remote one.
    pub fn is_shard_manager(&self) -> bool {
        self.general.shard_manager_address.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_parse() {
        let source = r#"
[general]
host = "0.0.0.0"
port = 7432

[sharding]
shard_groups = ["default", "billing"]
shards_per_group = 128

[storage]
backend = "sql"
database_url = "postgres://localhost/shardkeep"
"#;
        let config: Config = toml::from_str(source).unwrap();
        assert_eq!(config.sharding.shard_groups, vec!["default", "billing"]);
        assert_eq!(config.sharding.shards_per_group, 128);
        assert_eq!(
            config.storage.database_url.as_deref(),
            Some("postgres://localhost/shardkeep")
        );
    }

    #[test]
    fn test_default_is_shard_manager() {
        assert!(Config::default().is_shard_manager());
    }

    #[test]
    fn test_default_config_serializable() {
        let config = Config::default();
        toml::to_string(&config).unwrap();
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let path = Path::new("/nonexistent/shardkeep.toml");
        let loaded = ConfigFile::load(path).unwrap();
        assert_eq!(loaded.config, Config::default());
    }

    #[test]
    fn test_load_from_disk() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[sharding]\nshards_per_group = 64\n").unwrap();
        file.flush().unwrap();

        let loaded = ConfigFile::load(file.path()).unwrap();
        assert_eq!(loaded.config.sharding.shards_per_group, 64);
    }
}
