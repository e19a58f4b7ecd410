// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{PoolConfig, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path and run validation.
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` default functions).
/// - Checks worker count, program path and diagnostic buffer size.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<PoolConfig> {
    let raw_config = load_from_path(&path)?;
    let config = PoolConfig::try_from(raw_config)?;
    Ok(config)
}

/// Config path used when the embedding program does not pick one:
/// `$PROCPOOL_CONFIG` if set, else `Procpool.toml` in the working directory.
pub fn default_config_path() -> PathBuf {
    std::env::var_os("PROCPOOL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("Procpool.toml"))
}
