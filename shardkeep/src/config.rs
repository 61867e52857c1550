//! Process-wide configuration singleton.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use shardkeep_config::{Config, ConfigFile, Error};

static CONFIG: Lazy<ArcSwap<ConfigFile>> =
    Lazy::new(|| ArcSwap::from_pointee(ConfigFile::default()));

/// Get the current configuration.
pub fn config() -> Arc<ConfigFile> {
    CONFIG.load().clone()
}

/// Load `shardkeep.toml` from disk and install it as the process configuration.
pub fn load(path: &PathBuf) -> Result<ConfigFile, Error> {
    let loaded = ConfigFile::load(path)?;
    set(loaded.clone());
    Ok(loaded)
}

/// Install a configuration directly, bypassing disk I/O. Used by tests and
/// by the config-check subcommand.
pub fn set(config: ConfigFile) {
    CONFIG.store(Arc::new(config));
}

/// Path the currently installed configuration was loaded from.
pub fn path() -> PathBuf {
    config().path.clone()
}

#[cfg(test)]
pub fn load_test(config: Config) {
    set(ConfigFile {
        config,
        path: Path::new("test.toml").to_owned(),
    });
}
