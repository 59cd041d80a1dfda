// src/state/mod.rs

//! Lifecycle state: the in-memory session record and its on-disk snapshot.
//!
//! The snapshot lives at a fixed per-user path (`~/.spotrun/state.json`) so a
//! separate invocation (`spotrun teardown`, `spotrun status`) can find the
//! active instance even if the process that launched it crashed.
//!
//! Writes go to a fresh temporary file that is renamed over the target, so
//! concurrent readers never see a half-written record.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::errors::{Result, SpotrunError};
use crate::infra::{create_private_dir, RegionInfra};

/// Directory for all per-user spotrun files.
pub fn spotrun_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".spotrun"))
        .ok_or_else(|| SpotrunError::ConfigError("could not determine home directory".to_string()))
}

/// Serialized snapshot of the active instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub credential_path: Option<String>,
    #[serde(default)]
    pub credential_name: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
}

impl PersistedState {
    /// Enough to terminate the instance: an id and the region it lives in.
    pub fn is_usable(&self) -> bool {
        self.instance_id.is_some() && self.region.is_some()
    }

    /// Instance exists but its address was never recorded.
    pub fn is_provisioning(&self) -> bool {
        self.is_usable() && self.ip.is_none()
    }
}

/// The mutable record owned by a session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub instance_id: Option<String>,
    pub public_ip: Option<String>,
    pub region: String,
    pub credential_path: Option<PathBuf>,
    pub credential_name: Option<String>,
    pub group_id: Option<String>,
    pub fallback_log: Vec<String>,
    pub instance_type: Option<String>,
    pub vcpus: Option<u32>,
    pub price: Option<f64>,
}

impl SessionState {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            ..Default::default()
        }
    }

    /// Move to another region; anything tied to the old one is dropped.
    pub fn switch_region(&mut self, region: &str) {
        self.region = region.to_string();
        self.clear_instance();
        self.credential_path = None;
        self.credential_name = None;
        self.group_id = None;
    }

    pub fn apply_infra(&mut self, infra: &RegionInfra) {
        self.credential_path = Some(infra.credential_path.clone());
        self.credential_name = Some(infra.credential_name.clone());
        self.group_id = Some(infra.ingress_rule_id.clone());
    }

    pub fn clear_instance(&mut self) {
        self.instance_id = None;
        self.public_ip = None;
    }

    pub fn snapshot(&self) -> PersistedState {
        PersistedState {
            instance_id: self.instance_id.clone(),
            ip: self.public_ip.clone(),
            region: Some(self.region.clone()),
            credential_path: self
                .credential_path
                .as_ref()
                .map(|p| p.display().to_string()),
            credential_name: self.credential_name.clone(),
            group_id: self.group_id.clone(),
        }
    }
}

/// Durable single-record store for [`PersistedState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `~/.spotrun/state.json`.
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(spotrun_dir()?.join("state.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the stored record. The file is readable by the owner only.
    ///
    /// Each save writes its own uniquely named temporary file next to the
    /// target and renames it into place, so concurrent writers never publish
    /// each other's partial output.
    pub fn save(&self, state: &PersistedState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        create_private_dir(dir)?;

        let content = serde_json::to_string_pretty(state)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;
        tmp.write_all(content.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;

        debug!(
            path = %self.path.display(),
            instance_id = ?state.instance_id,
            ip = ?state.ip,
            "saved state"
        );
        Ok(())
    }

    /// Whatever is on disk, even if incomplete.
    ///
    /// `None` means no state file. A file that does not parse is reported as
    /// an empty (unusable) record rather than an error.
    pub fn load_raw(&self) -> Result<Option<PersistedState>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<PersistedState>(&contents) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state file is corrupt; treating as unusable");
                Ok(Some(PersistedState::default()))
            }
        }
    }

    /// The stored record, if it is complete enough to act on.
    pub fn load(&self) -> Result<Option<PersistedState>> {
        Ok(self.load_raw()?.filter(PersistedState::is_usable))
    }

    /// Remove the record only if it still describes `instance_id`.
    ///
    /// Returns whether anything was removed. A record for another instance,
    /// or none at all, is left alone.
    pub fn clear_if_owned(&self, instance_id: &str) -> Result<bool> {
        match self.load_raw()? {
            Some(record) if record.instance_id.as_deref() == Some(instance_id) => {
                self.clear()?;
                Ok(true)
            }
            Some(record) => {
                debug!(
                    path = %self.path.display(),
                    ours = %instance_id,
                    recorded = ?record.instance_id,
                    "state file belongs to another instance; leaving it"
                );
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Remove the record. No error if there is none.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "cleared state");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nested").join("state.json"));
        (dir, store)
    }

    #[test]
    fn save_is_owner_only() {
        let (_dir, store) = store();
        let mut session = SessionState::new("us-east-2");
        session.instance_id = Some("i-123".into());
        store.save(&session.snapshot()).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = fs::metadata(store.path().parent().unwrap())
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.instance_id.as_deref(), Some("i-123"));
        assert!(loaded.is_provisioning());
    }

    #[test]
    fn incomplete_or_corrupt_state_is_unusable() {
        let (_dir, store) = store();
        store
            .save(&PersistedState {
                region: Some("us-east-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(store.load().unwrap().is_none());
        assert!(store.load_raw().unwrap().is_some());

        fs::write(store.path(), "{ not json").unwrap();
        assert!(store.load().unwrap().is_none());
        assert_eq!(store.load_raw().unwrap(), Some(PersistedState::default()));
    }

    #[test]
    fn clear_is_idempotent() {
        let (_dir, store) = store();
        store.clear().unwrap();
        store.save(&PersistedState::default()).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load_raw().unwrap().is_none());
    }

    #[test]
    fn clear_if_owned_leaves_other_instances_alone() {
        let (_dir, store) = store();
        store
            .save(&PersistedState {
                instance_id: Some("i-earlier".into()),
                region: Some("eu-west-1".into()),
                ..Default::default()
            })
            .unwrap();

        assert!(!store.clear_if_owned("i-new").unwrap());
        assert!(store.load().unwrap().is_some());
        assert!(store.clear_if_owned("i-earlier").unwrap());
        assert!(store.load_raw().unwrap().is_none());
        assert!(!store.clear_if_owned("i-earlier").unwrap());
    }

    #[test]
    fn concurrent_saves_always_leave_a_whole_record() {
        let (_dir, store) = store();
        store.save(&PersistedState::default()).unwrap();

        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        let state = PersistedState {
                            instance_id: Some(format!("i-{n}-{i}")),
                            region: Some("us-east-1".into()),
                            credential_path: Some("/k".repeat(200 + n * 50)),
                            ..Default::default()
                        };
                        store.save(&state).unwrap();
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let raw = fs::read_to_string(store.path()).unwrap();
        let last: PersistedState = serde_json::from_str(&raw).unwrap();
        assert!(last.is_usable());
        let leftovers = fs::read_dir(store.path().parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn switching_region_drops_instance_and_infra() {
        let mut s = SessionState::new("us-east-1");
        s.instance_id = Some("i-1".into());
        s.group_id = Some("sg-1".into());
        s.fallback_log.push("kept".into());
        s.switch_region("eu-west-1");
        assert_eq!(s.region, "eu-west-1");
        assert!(s.instance_id.is_none());
        assert!(s.group_id.is_none());
        assert_eq!(s.fallback_log, vec!["kept".to_string()]);
    }
}
