// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

use crate::remote::sync::default_excludes;
use crate::watchdog::DEFAULT_HEARTBEAT_FILE;

/// Regions searched for spot capacity when no region is pinned.
pub const CANDIDATE_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-2",
    "eu-west-1",
    "eu-central-1",
    "ap-south-1",
    "ap-southeast-1",
    "ap-northeast-1",
];

pub fn default_regions() -> Vec<String> {
    CANDIDATE_REGIONS.iter().map(|r| r.to_string()).collect()
}

/// Configuration as read from `~/.spotrun/config.toml`.
///
/// ```toml
/// [defaults]
/// project_tag = "spotrun"
/// workers = 8
/// idle_timeout = 600
/// regions = ["us-east-1", "eu-west-1"]
/// excludes = [".git", "data"]
/// ```
///
/// Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub defaults: DefaultsSection,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsSection {
    /// Prefix for every provider resource spotrun creates.
    #[serde(default = "default_project_tag")]
    pub project_tag: String,

    #[serde(default = "default_workers")]
    pub workers: u32,

    /// Seconds of inactivity before the instance shuts itself down.
    /// `0` disables the watchdog.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_regions")]
    pub regions: Vec<String>,

    #[serde(default = "default_remote_root")]
    pub remote_root: String,

    #[serde(default = "default_remote_user")]
    pub remote_user: String,

    #[serde(default = "default_heartbeat_file")]
    pub heartbeat_file: String,

    #[serde(default = "default_wait_secs")]
    pub running_timeout_secs: u64,

    #[serde(default = "default_wait_secs")]
    pub ssh_timeout_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Patterns skipped when syncing a project directory.
    #[serde(default = "default_excludes")]
    pub excludes: Vec<String>,
}

fn default_project_tag() -> String {
    "spotrun".to_string()
}

fn default_workers() -> u32 {
    4
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_remote_root() -> String {
    "/opt/project".to_string()
}

fn default_remote_user() -> String {
    "ubuntu".to_string()
}

fn default_heartbeat_file() -> String {
    DEFAULT_HEARTBEAT_FILE.to_string()
}

fn default_wait_secs() -> u64 {
    300
}

fn default_poll_interval_secs() -> u64 {
    5
}

impl Default for DefaultsSection {
    fn default() -> Self {
        Self {
            project_tag: default_project_tag(),
            workers: default_workers(),
            idle_timeout: default_idle_timeout(),
            regions: default_regions(),
            remote_root: default_remote_root(),
            remote_user: default_remote_user(),
            heartbeat_file: default_heartbeat_file(),
            running_timeout_secs: default_wait_secs(),
            ssh_timeout_secs: default_wait_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            excludes: default_excludes(),
        }
    }
}

/// Validated configuration. Build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    defaults: DefaultsSection,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(defaults: DefaultsSection) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &DefaultsSection {
        &self.defaults
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.idle_timeout)
    }

    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.running_timeout_secs)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.defaults.ssh_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.defaults.poll_interval_secs)
    }
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self::new_unchecked(DefaultsSection::default())
    }
}
