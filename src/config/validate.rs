// src/config/validate.rs

use crate::config::model::{ConfigFile, DefaultsSection, RawConfigFile};
use crate::errors::{Result, SpotrunError};
use crate::pricing::catalog::MAX_WORKERS_ARM;
use crate::watchdog::validate_heartbeat_path;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = SpotrunError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_defaults(&raw.defaults)?;
        Ok(ConfigFile::new_unchecked(raw.defaults))
    }
}

fn validate_defaults(d: &DefaultsSection) -> Result<()> {
    if d.project_tag.trim().is_empty() {
        return Err(SpotrunError::ConfigError(
            "[defaults].project_tag must not be empty".to_string(),
        ));
    }

    // The arm limit is the looser one; the x86 limit is checked per request.
    if d.workers == 0 || d.workers > MAX_WORKERS_ARM {
        return Err(SpotrunError::ConfigError(format!(
            "[defaults].workers must be between 1 and {MAX_WORKERS_ARM} (got {})",
            d.workers
        )));
    }

    if d.regions.is_empty() {
        return Err(SpotrunError::ConfigError(
            "[defaults].regions must list at least one region".to_string(),
        ));
    }
    if let Some(r) = d.regions.iter().find(|r| r.trim().is_empty()) {
        return Err(SpotrunError::ConfigError(format!(
            "[defaults].regions contains an empty entry: {r:?}"
        )));
    }

    if d.poll_interval_secs == 0 {
        return Err(SpotrunError::ConfigError(
            "[defaults].poll_interval_secs must be >= 1 (got 0)".to_string(),
        ));
    }

    if !d.remote_root.starts_with('/') {
        return Err(SpotrunError::ConfigError(format!(
            "[defaults].remote_root must be absolute (got {})",
            d.remote_root
        )));
    }

    validate_heartbeat_path(&d.heartbeat_file)
        .map_err(|e| SpotrunError::ConfigError(format!("[defaults].heartbeat_file: {e}")))?;

    Ok(())
}
