// tests/infra_provisioner.rs

mod common;

use std::error::Error;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;

use spotrun::errors::SpotrunError;
use spotrun::infra::InfraProvisioner;
use spotrun_test_utils::ProviderCall;

use crate::common::{init_tracing, provisioner, with_timeout, FakeProvider};

type TestResult = Result<(), Box<dyn Error>>;

#[tokio::test]
async fn ensure_is_idempotent() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let provider = FakeProvider::new();
    let infra = provisioner(&provider, dir.path());

    let first = infra.ensure("proj", "us-east-1").await?;
    let second = infra.ensure("proj", "us-east-1").await?;

    assert_eq!(first, second);
    assert_eq!(first.credential_name, "proj-us-east-1");
    assert_eq!(first.ingress_rule_id, "sg-proj-ssh-us-east-1");
    assert_eq!(provider.credential_creates(), vec!["us-east-1".to_string()]);
    Ok(())
}

#[tokio::test]
async fn secret_file_is_owner_read_only() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let provider = FakeProvider::new();

    let infra = provisioner(&provider, dir.path())
        .ensure("proj", "eu-west-1")
        .await?;

    let mode = fs::metadata(&infra.credential_path)?.permissions().mode() & 0o777;
    assert_eq!(mode, 0o400);
    assert!(fs::read_to_string(&infra.credential_path)?.contains("proj-eu-west-1"));
    Ok(())
}

#[tokio::test]
async fn remote_credential_without_local_secret_is_rotated() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let provider = FakeProvider::new().with_existing_credential("us-east-1", "proj-us-east-1");

    let infra = provisioner(&provider, dir.path())
        .ensure("proj", "us-east-1")
        .await?;

    assert!(infra.credential_path.exists());
    let calls = provider.calls();
    let delete = calls
        .iter()
        .position(|c| matches!(c, ProviderCall::DeleteCredential { .. }))
        .ok_or("credential was not deleted")?;
    let create = calls
        .iter()
        .position(|c| matches!(c, ProviderCall::CreateCredential { .. }))
        .ok_or("credential was not recreated")?;
    assert!(delete < create);
    Ok(())
}

#[tokio::test]
async fn unexpected_describe_error_propagates() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let provider = FakeProvider::new().fail_describe("UnauthorizedOperation");

    let err = provisioner(&provider, dir.path())
        .ensure("proj", "us-east-1")
        .await
        .unwrap_err();

    assert!(err.is_auth(), "{err}");
    assert!(provider.credential_creates().is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_ensures_create_one_credential() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let provider = FakeProvider::new();
    let infra: Arc<InfraProvisioner> = provisioner(&provider, dir.path());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let infra = Arc::clone(&infra);
            tokio::spawn(async move { infra.ensure("proj", "us-west-2").await })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(with_timeout(handle).await??);
    }

    assert_eq!(provider.credential_creates().len(), 1);
    assert!(results.windows(2).all(|w| w[0] == w[1]));
    Ok(())
}

#[tokio::test]
async fn regions_get_separate_credentials() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let provider = FakeProvider::new();
    let infra = provisioner(&provider, dir.path());

    let east = infra.ensure("proj", "us-east-1").await?;
    let west = infra.ensure("proj", "us-west-2").await?;

    assert_ne!(east.credential_path, west.credential_path);
    assert_eq!(provider.credential_creates().len(), 2);
    Ok(())
}

#[test]
fn spotrun_error_is_send_and_sync() {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<SpotrunError>();
}
