// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Command-line arguments for `spotrun`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "spotrun",
    version,
    about = "Burst compute to cloud spot instances. Zero config, one command.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `SPOTRUN_CONFIG`, then `~/.spotrun/config.toml`.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SPOTRUN_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// More log output: `-v` for debug, `-vv` for trace.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Launch a spot instance, optionally sync files and run a command.
    Launch(LaunchArgs),
    /// Show current spot prices for compute instances.
    Prices(PricesArgs),
    /// Terminate the instance recorded in the state file.
    Teardown,
    /// Show the instance recorded in the state file.
    Status,
    /// Create the credential pair and SSH ingress rule in a region.
    Setup(SetupArgs),
}

#[derive(Debug, Clone, Args)]
pub struct LaunchArgs {
    /// Command to run on the instance. The instance is torn down afterwards.
    pub command: Option<String>,

    /// Number of parallel workers.
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub workers: Option<u32>,

    /// Path to sync to the instance (repeatable).
    #[arg(short = 's', long = "sync", value_name = "PATH")]
    pub sync: Vec<PathBuf>,

    /// Replace this process with an interactive SSH session.
    #[arg(long, conflicts_with = "command")]
    pub ssh: bool,

    /// Project tag for provider resources.
    #[arg(long = "tag", value_name = "TAG")]
    pub tag: Option<String>,

    /// Include arm64 instances (cheaper, may have compatibility issues).
    #[arg(long)]
    pub arm: bool,

    /// Disable hyperthreading (one thread per core) on x86 instances.
    #[arg(long = "no-ht")]
    pub no_ht: bool,

    /// Pin the region. Defaults to `AWS_REGION` when set.
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// Seconds of inactivity before the instance shuts down; 0 disables.
    #[arg(long, value_name = "SECS")]
    pub idle_timeout: Option<u64>,

    /// Fail on the first capacity error instead of trying other candidates.
    #[arg(long)]
    pub no_fallback: bool,
}

#[derive(Debug, Clone, Args)]
pub struct PricesArgs {
    /// Number of parallel workers.
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    pub workers: Option<u32>,

    /// Include arm64 instances.
    #[arg(long)]
    pub arm: bool,

    /// Show a per-type table for this region. Defaults to `AWS_REGION`.
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct SetupArgs {
    /// Project tag for provider resources.
    #[arg(long = "tag", value_name = "TAG")]
    pub tag: Option<String>,

    /// Region to set up. Defaults to `AWS_REGION`, then the first configured
    /// region.
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// Resolve the arm64 image instead of x86_64.
    #[arg(long)]
    pub arm: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_flags_parse() {
        let args = CliArgs::try_parse_from([
            "spotrun", "launch", "-w", "8", "-s", "src", "-s", "data", "--arm", "--no-ht",
            "--no-fallback", "--log-level", "debug", "python run.py",
        ])
        .unwrap();
        let Command::Launch(l) = args.command else {
            panic!("expected launch");
        };
        assert_eq!(l.workers, Some(8));
        assert_eq!(l.sync, vec![PathBuf::from("src"), PathBuf::from("data")]);
        assert!(l.arm && l.no_ht && l.no_fallback);
        assert_eq!(l.command.as_deref(), Some("python run.py"));
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
    }

    #[test]
    fn verbosity_counts_after_the_subcommand() {
        let args = CliArgs::try_parse_from(["spotrun", "-v", "status"]).unwrap();
        assert_eq!(args.verbose, 1);
        let args = CliArgs::try_parse_from(["spotrun", "teardown", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
        let args = CliArgs::try_parse_from(["spotrun", "status"]).unwrap();
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(CliArgs::try_parse_from(["spotrun", "prices", "-w", "0"]).is_err());
    }

    #[test]
    fn ssh_and_command_conflict() {
        assert!(CliArgs::try_parse_from(["spotrun", "launch", "--ssh", "ls"]).is_err());
    }
}
