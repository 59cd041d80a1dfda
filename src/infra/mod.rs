// src/infra/mod.rs

//! Per-region prerequisite resources: the SSH credential pair and the
//! ingress rule that lets us reach the instance.
//!
//! Credential creation is not atomic on the provider side (check, then
//! create), so the provisioner serializes it behind a mutex it owns. Share
//! one provisioner (behind an `Arc`) between sessions that run in the same
//! process.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{Result, SpotrunError};
use crate::provider::CloudProvider;

/// Resources a region needs before an instance can be requested there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfra {
    pub credential_name: String,
    pub credential_path: PathBuf,
    pub ingress_rule_id: String,
}

/// Name of the credential pair for a project in a region.
pub fn credential_name(project_tag: &str, region: &str) -> String {
    format!("{project_tag}-{region}")
}

/// Name of the SSH ingress group for a project.
pub fn ingress_group_name(project_tag: &str) -> String {
    format!("{project_tag}-ssh")
}

pub struct InfraProvisioner {
    provider: Arc<dyn CloudProvider>,
    secrets_dir: PathBuf,
    credential_lock: Mutex<()>,
}

impl std::fmt::Debug for InfraProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfraProvisioner")
            .field("secrets_dir", &self.secrets_dir)
            .finish_non_exhaustive()
    }
}

impl InfraProvisioner {
    /// `secrets_dir` holds one `<credential>.pem` per region.
    pub fn new(provider: Arc<dyn CloudProvider>, secrets_dir: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            secrets_dir: secrets_dir.into(),
            credential_lock: Mutex::new(()),
        }
    }

    pub fn secrets_dir(&self) -> &Path {
        &self.secrets_dir
    }

    /// Make sure the credential pair and ingress rule exist in `region`.
    ///
    /// Idempotent: existing resources are found by a provider-side lookup and
    /// returned without being recreated. A credential that exists remotely
    /// but whose local secret is gone is unusable, so it is rotated.
    pub async fn ensure(&self, project_tag: &str, region: &str) -> Result<RegionInfra> {
        let credential_name = credential_name(project_tag, region);
        let credential_path = self.secrets_dir.join(format!("{credential_name}.pem"));

        {
            let _guard = self.credential_lock.lock().await;
            create_private_dir(&self.secrets_dir)?;

            let need_create = match self
                .provider
                .describe_credential(region, &credential_name)
                .await
            {
                Ok(()) if credential_path.exists() => {
                    debug!(region = %region, credential = %credential_name, "credential pair exists");
                    false
                }
                Ok(()) => {
                    warn!(
                        region = %region,
                        credential = %credential_name,
                        "credential exists remotely but its secret is missing locally; recreating"
                    );
                    self.provider
                        .delete_credential(region, &credential_name)
                        .await?;
                    true
                }
                Err(SpotrunError::Provider(e)) if e.is_not_found() => true,
                Err(e) => return Err(e),
            };

            if need_create {
                info!(region = %region, credential = %credential_name, "creating credential pair");
                let secret = self
                    .provider
                    .create_credential(region, &credential_name)
                    .await?;
                write_secret(&credential_path, &secret)?;
            }
        }

        let ingress_rule_id = self
            .provider
            .ensure_ingress_rule(region, &ingress_group_name(project_tag), project_tag)
            .await?;

        Ok(RegionInfra {
            credential_name,
            credential_path,
            ingress_rule_id,
        })
    }
}

/// Create `dir` (and parents) readable only by the owner.
pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
    Ok(())
}

/// Write secret material to a fresh owner-read-only file.
fn write_secret(path: &Path, secret: &str) -> Result<()> {
    // A stale 0400 file cannot be reopened for writing.
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o400)
        .open(path)?;
    file.write_all(secret.as_bytes())?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o400))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_scoped_by_project_and_region() {
        assert_eq!(credential_name("spotrun", "eu-west-1"), "spotrun-eu-west-1");
        assert_eq!(ingress_group_name("spotrun"), "spotrun-ssh");
    }

    #[test]
    fn secret_file_is_owner_read_only_and_replaceable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("k.pem");

        write_secret(&path, "first").unwrap();
        write_secret(&path, "second").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);
    }
}
