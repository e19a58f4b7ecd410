// src/config/validate.rs

use crate::config::model::{MIN_STDERR_LIMIT, PoolConfig, RawConfigFile};
use crate::errors::{PoolError, Result};

impl TryFrom<RawConfigFile> for PoolConfig {
    type Error = crate::errors::PoolError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let cfg = PoolConfig::new_unchecked(raw);
        validate_config(&cfg)?;
        Ok(cfg)
    }
}

/// Check the invariants a pool relies on.
///
/// Called for file-based configs during loading and again by `Pool::new`, so
/// programmatically built configs get the same treatment.
pub fn validate_config(cfg: &PoolConfig) -> Result<()> {
    validate_pool_section(cfg)?;
    validate_worker_section(cfg)?;
    Ok(())
}

fn validate_pool_section(cfg: &PoolConfig) -> Result<()> {
    if cfg.workers == 0 {
        return Err(PoolError::ConfigError(
            "[pool].workers must be >= 1 (got 0)".to_string(),
        ));
    }

    if cfg.name_prefix.trim().is_empty() {
        return Err(PoolError::ConfigError(
            "[pool].name_prefix must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_worker_section(cfg: &PoolConfig) -> Result<()> {
    if cfg.worker.spawn.program.as_os_str().is_empty() {
        return Err(PoolError::ConfigError(
            "[worker].program must not be empty".to_string(),
        ));
    }

    if cfg.worker.stderr_limit < MIN_STDERR_LIMIT {
        return Err(PoolError::ConfigError(format!(
            "[worker].stderr_limit must be >= {} (got {})",
            MIN_STDERR_LIMIT, cfg.worker.stderr_limit
        )));
    }

    Ok(())
}
