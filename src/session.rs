// src/session.rs

//! User-facing orchestrator: launch, sync, run, teardown.
//!
//! A [`Session`] owns the [`SessionState`] for one instance. It drives the
//! acquisition engine, installs the idle watchdog and then hands out remote
//! operations through the connected [`RemoteExecutor`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::ConfigFile;
use crate::engine::{Acquired, AcquisitionEngine, AcquisitionOptions};
use crate::errors::{Result, SpotrunError};
use crate::infra::InfraProvisioner;
use crate::pricing::catalog::all_instance_types;
use crate::pricing::{select_instance, PriceMap, PriceOracle, WorkloadRequest};
use crate::provider::CloudProvider;
use crate::remote::{shell_quote, RemoteConnector, RemoteExecutor, RemoteOutput, RunMode, StopSignal};
use crate::state::{SessionState, StateStore};
use crate::watchdog;

/// Knobs for a session, usually taken from the config file and CLI flags.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub project_tag: String,
    pub regions: Vec<String>,
    /// Set by `--region` or `AWS_REGION`; disables cross-region search.
    pub pinned_region: Option<String>,
    pub fallback: bool,
    /// Zero disables the watchdog.
    pub idle_timeout: Duration,
    pub heartbeat_file: String,
    pub remote_root: String,
    pub excludes: Vec<String>,
    pub running_timeout: Duration,
    pub ssh_timeout: Duration,
}

impl SessionOptions {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let d = cfg.defaults();
        Self {
            project_tag: d.project_tag.clone(),
            regions: d.regions.clone(),
            pinned_region: None,
            fallback: true,
            idle_timeout: cfg.idle_timeout(),
            heartbeat_file: d.heartbeat_file.clone(),
            remote_root: d.remote_root.clone(),
            excludes: d.excludes.clone(),
            running_timeout: cfg.running_timeout(),
            ssh_timeout: cfg.ssh_timeout(),
        }
    }

    fn acquisition_options(&self) -> AcquisitionOptions {
        AcquisitionOptions {
            project_tag: self.project_tag.clone(),
            regions: self.regions.clone(),
            pinned_region: self.pinned_region.clone(),
            fallback: self.fallback,
            running_timeout: self.running_timeout,
            reachable_timeout: self.ssh_timeout,
        }
    }

    /// The region a session starts in before any ranking.
    fn initial_region(&self) -> String {
        self.pinned_region
            .clone()
            .or_else(|| self.regions.first().cloned())
            .unwrap_or_else(|| "us-east-1".to_string())
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&ConfigFile::default())
    }
}

/// Single-region pricing snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PricingInfo {
    pub region: String,
    pub instance_type: String,
    pub vcpus: u32,
    pub spot_price: Option<f64>,
    pub all_prices: PriceMap,
}

pub struct Session {
    provider: Arc<dyn CloudProvider>,
    provisioner: Arc<InfraProvisioner>,
    connector: Arc<dyn RemoteConnector>,
    store: Option<StateStore>,
    options: SessionOptions,
    request: WorkloadRequest,
    state: SessionState,
    remote: Option<Arc<dyn RemoteExecutor>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("options", &self.options)
            .field("request", &self.request)
            .field("state", &self.state)
            .field("connected", &self.remote.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// `store` is `None` to run without persisted state.
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        provisioner: Arc<InfraProvisioner>,
        connector: Arc<dyn RemoteConnector>,
        store: Option<StateStore>,
        request: WorkloadRequest,
        options: SessionOptions,
    ) -> Result<Self> {
        request.validate()?;
        let state = SessionState::new(options.initial_region());
        Ok(Self {
            provider,
            provisioner,
            connector,
            store,
            options,
            request,
            state,
            remote: None,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn fallback_log(&self) -> &[String] {
        &self.state.fallback_log
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    fn remote(&self) -> Result<&Arc<dyn RemoteExecutor>> {
        self.remote.as_ref().ok_or(SpotrunError::NoActiveSession)
    }

    /// Acquire an instance, connect to it and install the idle watchdog.
    ///
    /// Returns the public IP.
    pub async fn launch(&mut self) -> Result<String> {
        if !self.options.fallback && self.options.pinned_region.is_none() {
            self.pick_start_region().await?;
        }

        let mut engine = AcquisitionEngine::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.provisioner),
            self.store.clone(),
            self.options.acquisition_options(),
        );
        let Acquired {
            candidate,
            public_ip,
            infra,
            ..
        } = engine.acquire(&self.request, &mut self.state).await?;

        let remote = self.connector.connect(&public_ip, &infra.credential_path);
        self.remote = Some(Arc::clone(&remote));

        if let Err(err) = watchdog::install(
            remote.as_ref(),
            self.options.idle_timeout,
            &self.options.heartbeat_file,
        )
        .await
        {
            error!(error = %err, "failed to install idle watchdog; tearing down");
            if let Err(teardown_err) = self.teardown().await {
                error!(error = %teardown_err, "teardown after watchdog failure also failed");
            }
            return Err(err);
        }

        info!(
            region = %candidate.region,
            instance_type = %candidate.instance_type,
            vcpus = candidate.vcpus,
            price = candidate.price_per_hour,
            ip = %public_ip,
            "instance ready"
        );
        Ok(public_ip)
    }

    /// Without fallback the session tries one candidate in one region, so
    /// start where the smallest qualifying type is cheapest.
    async fn pick_start_region(&mut self) -> Result<()> {
        let (instance_type, _) = select_instance(&self.request, None)?;
        let oracle = PriceOracle::new(Arc::clone(&self.provider));
        let by_region = oracle
            .compare_regions(&instance_type, &self.options.regions)
            .await?;
        if let Some((region, price)) = by_region.into_iter().next() {
            info!(region = %region, instance_type = %instance_type, price, "starting in cheapest region");
            self.state.region = region;
        }
        Ok(())
    }

    /// Rsync individual paths into the remote project root.
    pub async fn sync(&self, paths: &[impl AsRef<Path>], quiet: bool) -> Result<()> {
        let remote = self.remote()?;
        for path in paths {
            remote
                .rsync_to(path.as_ref(), &self.options.remote_root, quiet)
                .await?;
        }
        Ok(())
    }

    /// Rsync the contents of `local_root` into the remote project root.
    pub async fn sync_project(&self, local_root: &Path, quiet: bool) -> Result<()> {
        self.remote()?
            .rsync_project(
                local_root,
                &self.options.remote_root,
                &self.options.excludes,
                quiet,
            )
            .await
    }

    /// Install Python dependencies into the remote project venv.
    ///
    /// Looks for `requirements.txt`, then `pyproject.toml`. Returns whether
    /// an install was attempted; a failing install is logged, not returned.
    pub async fn install_deps(&self) -> Result<bool> {
        let remote = self.remote()?;
        let root = shell_quote(&self.options.remote_root);

        let venv_check = remote
            .run_remote(&format!("test -d {root}/.venv/bin"), RunMode::Quiet, None)
            .await?;
        if venv_check.exit_code() != 0 {
            info!("no remote venv; skipping dependency install");
            return Ok(false);
        }

        let detect = format!(
            "test -f {root}/requirements.txt && echo requirements \
             || (test -f {root}/pyproject.toml && echo pyproject || echo none)"
        );
        let kind = match remote.run_remote(&detect, RunMode::Capture, None).await {
            Ok(RemoteOutput::Captured(out)) => out.trim().to_string(),
            Ok(_) => return Ok(false),
            Err(e) => {
                warn!(error = %e, "could not detect dependency files");
                return Ok(false);
            }
        };

        let install = match kind.as_str() {
            "requirements" => format!(
                "{root}/.venv/bin/pip install --quiet -r {root}/requirements.txt"
            ),
            "pyproject" => format!(
                "{root}/.venv/bin/python -c \"import subprocess, sys, tomllib; \
                 deps = tomllib.load(open(sys.argv[1], 'rb')).get('project', {{}}).get('dependencies', []); \
                 deps and subprocess.check_call([sys.executable, '-m', 'pip', 'install', '--quiet', *deps])\" \
                 {root}/pyproject.toml"
            ),
            _ => return Ok(false),
        };
        info!(source = %kind, "installing remote dependencies");

        let out = remote.run_remote(&install, RunMode::Stream, None).await?;
        if out.exit_code() != 0 {
            warn!(exit_code = out.exit_code(), "dependency installation returned non-zero exit code");
        }
        Ok(true)
    }

    /// Run `command` on the instance with the project venv activated (if
    /// there is one).
    pub async fn run(
        &self,
        command: &str,
        mode: RunMode,
        stop: Option<StopSignal>,
    ) -> Result<RemoteOutput> {
        let wrapped = venv_wrapped(&self.options.remote_root, command);
        self.remote()?.run_remote(&wrapped, mode, stop).await
    }

    /// Replace this process with an interactive shell on the instance.
    ///
    /// Only returns on failure.
    pub fn ssh(&self) -> SpotrunError {
        match self.remote() {
            Ok(remote) => remote.exec_interactive(),
            Err(e) => e,
        }
    }

    /// Terminate the instance and clear persisted state.
    ///
    /// Safe to call in any state. If termination fails, the persisted state
    /// is kept so a later `spotrun teardown` can retry.
    pub async fn teardown(&mut self) -> Result<()> {
        let Some(instance_id) = self.state.instance_id.clone() else {
            debug!("no instance owned by this session; leaving state file alone");
            return Ok(());
        };
        self.provider
            .terminate(&self.state.region, &instance_id)
            .await?;
        info!(region = %self.state.region, instance_id = %instance_id, "instance terminated");
        self.state.clear_instance();
        self.remote = None;
        if let Some(store) = &self.store {
            store.clear_if_owned(&instance_id)?;
        }
        Ok(())
    }

    /// Prices in the current region and the type a launch would pick there.
    pub async fn pricing_info(&self) -> Result<PricingInfo> {
        let oracle = PriceOracle::new(Arc::clone(&self.provider));
        let all_prices = oracle
            .region_prices(
                &self.state.region,
                &all_instance_types(self.request.allow_alternate_arch),
            )
            .await?;
        let (instance_type, vcpus) = select_instance(&self.request, Some(&all_prices))?;
        Ok(PricingInfo {
            region: self.state.region.clone(),
            spot_price: all_prices.get(&instance_type).copied(),
            instance_type,
            vcpus,
            all_prices,
        })
    }
}

/// `command` run inside the project venv when it exists.
pub fn venv_wrapped(remote_root: &str, command: &str) -> String {
    let activate = shell_quote(&format!("{remote_root}/.venv/bin/activate"));
    format!("if [ -f {activate} ]; then source {activate}; fi && ({command})")
}

/// What a state-file teardown did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownOutcome {
    NoState,
    /// The state was missing an instance id or region and was cleared
    /// without terminating anything.
    IncompleteCleared,
    Terminated { instance_id: String, region: String },
}

/// Terminate whatever the persisted state points at, from a process that did
/// not launch it.
///
/// An instance that is already gone counts as terminated. Any other
/// termination error is returned and the state file is kept.
pub async fn teardown_persisted(
    provider: &dyn CloudProvider,
    store: &StateStore,
) -> Result<TeardownOutcome> {
    let Some(state) = store.load_raw()? else {
        return Ok(TeardownOutcome::NoState);
    };

    let (Some(instance_id), Some(region)) = (state.instance_id, state.region) else {
        warn!(path = %store.path().display(), "state file is incomplete; clearing");
        store.clear()?;
        return Ok(TeardownOutcome::IncompleteCleared);
    };

    provider.terminate(&region, &instance_id).await?;
    store.clear()?;
    info!(region = %region, instance_id = %instance_id, "instance terminated");
    Ok(TeardownOutcome::Terminated {
        instance_id,
        region,
    })
}
