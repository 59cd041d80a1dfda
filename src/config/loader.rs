// src/config/loader.rs

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;
use crate::state::spotrun_dir;

/// Env var that overrides the config file location.
pub const CONFIG_ENV: &str = "SPOTRUN_CONFIG";

/// Read and parse a config file without semantic validation.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    let config: RawConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

/// Read, parse and validate a config file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Like [`load_and_validate`], but a missing file yields the defaults.
pub fn load_or_default(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    match fs::metadata(path) {
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file; using defaults");
            Ok(ConfigFile::default())
        }
        _ => load_and_validate(path),
    }
}

/// `--config`, then `SPOTRUN_CONFIG`, then `~/.spotrun/config.toml`.
pub fn resolve_config_path(cli_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = cli_path {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(CONFIG_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(p));
    }
    default_config_path()
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(spotrun_dir()?.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.defaults().workers, 4);
        assert_eq!(cfg.defaults().project_tag, "spotrun");
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[defaults]\nworkers = 8\nregions = [\"eu-west-1\"]\nexcludes = [\"data\"]\n",
        )
        .unwrap();

        let cfg = load_or_default(&path).unwrap();
        assert_eq!(cfg.defaults().workers, 8);
        assert_eq!(cfg.defaults().regions, vec!["eu-west-1".to_string()]);
        assert_eq!(cfg.defaults().excludes, vec!["data".to_string()]);
        assert_eq!(cfg.defaults().remote_root, "/opt/project");
        assert_eq!(cfg.poll_interval().as_secs(), 5);
    }

    #[test]
    fn invalid_toml_and_invalid_values_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        fs::write(&path, "[defaults\n").unwrap();
        assert!(load_or_default(&path).is_err());

        fs::write(&path, "[defaults]\nworkers = 0\n").unwrap();
        assert!(load_or_default(&path).is_err());
    }

    #[test]
    fn cli_path_wins() {
        let p = resolve_config_path(Some(Path::new("/etc/spotrun.toml"))).unwrap();
        assert_eq!(p, PathBuf::from("/etc/spotrun.toml"));
    }
}
