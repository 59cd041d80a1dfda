#![allow(dead_code, unused_imports)]

use std::path::Path;
use std::sync::Arc;

pub use spotrun_test_utils::builders;
pub use spotrun_test_utils::{init_tracing, with_timeout, FakeConnector, FakeProvider, FakeRemote};

use spotrun::engine::{AcquisitionEngine, AcquisitionOptions};
use spotrun::infra::InfraProvisioner;
use spotrun::provider::CloudProvider;
use spotrun::state::StateStore;

/// Provisioner writing secrets under `dir`.
pub fn provisioner(provider: &FakeProvider, dir: &Path) -> Arc<InfraProvisioner> {
    let provider: Arc<dyn CloudProvider> = Arc::new(provider.clone());
    Arc::new(InfraProvisioner::new(provider, dir.join("secrets")))
}

/// Engine over `provider` with state persisted under `dir`.
pub fn engine(provider: &FakeProvider, dir: &Path, options: AcquisitionOptions) -> AcquisitionEngine {
    AcquisitionEngine::new(
        Arc::new(provider.clone()),
        provisioner(provider, dir),
        Some(store(dir)),
        options,
    )
}

pub fn store(dir: &Path) -> StateStore {
    StateStore::new(dir.join("state").join("state.json"))
}
