// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod infra;
pub mod logging;
pub mod pricing;
pub mod provider;
pub mod remote;
pub mod session;
pub mod state;
pub mod types;
pub mod watchdog;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use crate::cli::{CliArgs, Command, LaunchArgs, PricesArgs, SetupArgs};
use crate::config::{load_or_default, resolve_config_path, ConfigFile};
use crate::infra::InfraProvisioner;
use crate::pricing::catalog::{all_instance_types, estimate_cost, COMPUTE_INSTANCES};
use crate::pricing::{select_instance, PriceOracle, WorkloadRequest};
use crate::provider::{AwsCliProvider, CloudProvider};
use crate::remote::{RemoteOutput, RunMode, SshConnector};
use crate::session::{teardown_persisted, Session, SessionOptions, TeardownOutcome};
use crate::state::{spotrun_dir, StateStore};
use crate::types::Arch;

/// Exit code for a remote command stopped by Ctrl-C.
const EXIT_INTERRUPTED: i32 = 130;

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let config_path = resolve_config_path(args.config.as_deref())?;
    let cfg = load_or_default(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    debug!(path = %config_path.display(), "configuration loaded");

    match args.command {
        Command::Launch(a) => launch(&cfg, a).await,
        Command::Prices(a) => prices(&cfg, a).await.map(|()| 0),
        Command::Teardown => teardown(&cfg).await.map(|()| 0),
        Command::Status => status().map(|()| 0),
        Command::Setup(a) => setup(&cfg, a).await.map(|()| 0),
    }
}

/// `--region`, then a non-empty `AWS_REGION`.
fn pinned_region(flag: Option<String>) -> Option<String> {
    flag.or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()))
}

fn aws_provider(cfg: &ConfigFile) -> Arc<dyn CloudProvider> {
    Arc::new(AwsCliProvider::new(cfg.poll_interval()))
}

async fn launch(cfg: &ConfigFile, args: LaunchArgs) -> Result<i32> {
    let d = cfg.defaults();
    let provider = aws_provider(cfg);
    let dir = spotrun_dir()?;
    let provisioner = Arc::new(InfraProvisioner::new(Arc::clone(&provider), &dir));
    let connector = Arc::new(SshConnector::new(&d.remote_user, dir.join("known_hosts")));
    let store = StateStore::default_location()?;

    let mut options = SessionOptions::from_config(cfg);
    if let Some(tag) = &args.tag {
        options.project_tag = tag.clone();
    }
    if let Some(secs) = args.idle_timeout {
        options.idle_timeout = std::time::Duration::from_secs(secs);
    }
    options.pinned_region = pinned_region(args.region.clone());
    options.fallback = !args.no_fallback;

    let request = WorkloadRequest::new(args.workers.unwrap_or(d.workers))
        .allow_alternate_arch(args.arm)
        .disable_hyperthreading(args.no_ht);

    let mut session = Session::new(
        provider,
        provisioner,
        connector,
        Some(store),
        request,
        options,
    )?;

    let result = drive_launch(&mut session, &args).await;
    let keep = matches!(result, Ok(LaunchOutcome::Keep));
    if !keep {
        if let Err(e) = session.teardown().await {
            error!(error = %e, "teardown failed; run `spotrun teardown` to retry");
        }
    }

    match result? {
        LaunchOutcome::Keep => Ok(0),
        LaunchOutcome::Finished(code) => Ok(code),
    }
}

enum LaunchOutcome {
    /// No command and no shell: leave the instance running.
    Keep,
    Finished(i32),
}

async fn drive_launch(session: &mut Session, args: &LaunchArgs) -> Result<LaunchOutcome> {
    let ip = session.launch().await?;
    for line in session.fallback_log() {
        info!("{line}");
    }
    print_selected(session);

    if !args.sync.is_empty() {
        session.sync(&args.sync, false).await?;
    }

    if args.ssh {
        println!("Entering SSH session. Run `spotrun teardown` when done.");
        return Err(session.ssh().into());
    }

    let Some(command) = &args.command else {
        println!("Instance running at {ip}");
        println!("Run `spotrun teardown` when done.");
        return Ok(LaunchOutcome::Keep);
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = stop_tx.send(());
        }
    });
    let output = session.run(command, RunMode::Stream, Some(stop_rx)).await;
    ctrl_c.abort();

    let code = match output? {
        RemoteOutput::Cancelled => {
            println!("Command interrupted.");
            EXIT_INTERRUPTED
        }
        other => other.exit_code(),
    };
    if code == 0 {
        println!("Command completed successfully.");
    } else if code != EXIT_INTERRUPTED {
        println!("Command exited with code {code}");
    }
    Ok(LaunchOutcome::Finished(code))
}

fn print_selected(session: &Session) {
    let state = session.state();
    if let (Some(itype), Some(vcpus)) = (&state.instance_type, state.vcpus) {
        match state.price {
            Some(price) => println!(
                "Selected {itype} ({vcpus} vCPUs) in {} @ ${price:.4}/hr",
                state.region
            ),
            None => println!("Selected {itype} ({vcpus} vCPUs) in {}", state.region),
        }
    }
}

async fn prices(cfg: &ConfigFile, args: PricesArgs) -> Result<()> {
    let d = cfg.defaults();
    let workers = args.workers.unwrap_or(d.workers);
    let request = WorkloadRequest::new(workers).allow_alternate_arch(args.arm);
    let (mut instance_type, mut vcpus) = select_instance(&request, None)?;
    let oracle = PriceOracle::new(aws_provider(cfg));

    match pinned_region(args.region) {
        Some(region) => {
            let prices = oracle
                .region_prices(&region, &all_instance_types(args.arm))
                .await?;
            (instance_type, vcpus) = select_instance(&request, Some(&prices))?;

            println!("Spot prices ({region})");
            println!("{:<14} {:<7} {:>5} {:>9}", "Instance", "Arch", "vCPUs", "$/hr");
            for spec in COMPUTE_INSTANCES {
                if spec.arch == Arch::Arm64 && !args.arm {
                    continue;
                }
                let price = prices
                    .get(spec.instance_type)
                    .map(|p| format!("${p:.4}"))
                    .unwrap_or_else(|| "n/a".to_string());
                let marker = if spec.instance_type == instance_type {
                    "  <-- selected"
                } else {
                    ""
                };
                println!(
                    "{:<14} {:<7} {:>5} {:>9}{marker}",
                    spec.instance_type,
                    spec.arch.as_str(),
                    spec.vcpus,
                    price
                );
            }
            if let Some(price) = prices.get(&instance_type) {
                println!(
                    "Estimated cost: ${price:.4}/hr (${:.2} for 8h)",
                    estimate_cost(*price, 8.0 * 60.0)
                );
            }
            println!("\n{workers} workers -> {instance_type} ({vcpus} vCPUs)");
        }
        None => {
            let by_region = oracle.compare_regions(&instance_type, &d.regions).await?;
            if by_region.is_empty() {
                println!("No pricing data available for any region.");
            } else {
                println!("Spot prices for {instance_type} ({vcpus} vCPUs)");
                println!("{:<16} {:>9}", "Region", "$/hr");
                for (i, (region, price)) in by_region.iter().enumerate() {
                    let marker = if i == 0 { "  <-- cheapest" } else { "" };
                    println!("{region:<16} {:>9}{marker}", format!("${price:.4}"));
                }
            }
            println!("\n{workers} workers -> {instance_type} ({vcpus} vCPUs)");
            if let Some((region, price)) = by_region.first() {
                println!("Cheapest: {region} at ${price:.4}/hr");
            }
        }
    }
    Ok(())
}

async fn teardown(cfg: &ConfigFile) -> Result<()> {
    let provider = aws_provider(cfg);
    let store = StateStore::default_location()?;
    match teardown_persisted(provider.as_ref(), &store).await? {
        TeardownOutcome::NoState => println!("No active instance found."),
        TeardownOutcome::IncompleteCleared => println!("State file was incomplete. Cleared."),
        TeardownOutcome::Terminated {
            instance_id,
            region,
        } => println!("Terminated {instance_id} in {region}. Teardown complete."),
    }
    Ok(())
}

fn status() -> Result<()> {
    let store = StateStore::default_location()?;
    let Some(state) = store.load_raw()? else {
        println!("No active instance.");
        return Ok(());
    };
    if !state.is_usable() {
        println!("State file is incomplete. Run `spotrun teardown` to clear it.");
        return Ok(());
    }

    let show = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    println!("Instance:   {}", show(&state.instance_id));
    println!("Region:     {}", show(&state.region));
    if state.is_provisioning() {
        println!("IP:         - (still provisioning)");
    } else {
        println!("IP:         {}", show(&state.ip));
    }
    println!("Key:        {}", show(&state.credential_path));
    println!("Group:      {}", show(&state.group_id));
    Ok(())
}

async fn setup(cfg: &ConfigFile, args: SetupArgs) -> Result<()> {
    let d = cfg.defaults();
    let provider = aws_provider(cfg);
    let tag = args.tag.unwrap_or_else(|| d.project_tag.clone());
    let region = pinned_region(args.region)
        .or_else(|| d.regions.first().cloned())
        .context("no region configured")?;

    let provisioner = InfraProvisioner::new(Arc::clone(&provider), spotrun_dir()?);
    let infra = provisioner.ensure(&tag, &region).await?;
    println!("Infrastructure ready in {region}.");
    println!("  credential: {} ({})", infra.credential_name, infra.credential_path.display());
    println!("  ingress group: {}", infra.ingress_rule_id);

    let arch = if args.arm { Arch::Arm64 } else { Arch::X86_64 };
    let image = provider.find_image(&region, &tag, arch).await?;
    println!("  image: {image} ({arch})");
    Ok(())
}
