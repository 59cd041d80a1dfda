pub mod builders;
pub mod fake_provider;
pub mod fake_remote;

use std::future::Future;
use std::sync::Once;
use std::time::Duration;

use tracing_subscriber::{fmt, EnvFilter};

pub use fake_provider::{FakeProvider, ProviderCall};
pub use fake_remote::{FakeConnector, FakeRemote, RemoteCall};

static INIT: Once = Once::new();

/// Upper bound for a single awaited step in the async tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Route `tracing` output into the test harness capture.
///
/// The filter is `SPOTRUN_TEST_LOG`, then `RUST_LOG`, then debug for the
/// crate under test and warn for everything else. Output is only shown for
/// failing tests unless run with `--nocapture`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let directives = ["SPOTRUN_TEST_LOG", "RUST_LOG"]
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| "warn,spotrun=debug".to_string());
        let filter = EnvFilter::try_new(&directives)
            .unwrap_or_else(|_| EnvFilter::new("warn,spotrun=debug"));

        // A test binary may have installed its own subscriber already.
        let _ = fmt()
            .compact()
            .without_time()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Await `f`, failing the test if it takes longer than [`TEST_TIMEOUT`].
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(TEST_TIMEOUT, f).await {
        Ok(value) => value,
        Err(_) => panic!("step did not finish within {TEST_TIMEOUT:?}"),
    }
}
