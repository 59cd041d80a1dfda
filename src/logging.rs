// src/logging.rs

//! Stderr logging for the `spotrun` binary.
//!
//! The filter comes from the first of these that is set:
//! 1. `--log-level LEVEL`
//! 2. `-v` (debug) or `-vv` (trace)
//! 3. `SPOTRUN_LOG`, read as full `EnvFilter` directives
//!    (e.g. `spotrun=debug,aws_config=info`)
//! 4. `spotrun=info` with everything else at `warn`
//!
//! Lines are compact and carry the fields of the enclosing spans, so every
//! event logged while trying a candidate names its region and instance type.
//! Remote command output goes to stdout and is never mixed in.

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{fmt, EnvFilter};

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "SPOTRUN_LOG";

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, verbose: u8) -> Result<()> {
    let env = std::env::var(LOG_ENV).ok();
    let directives = directives(cli_level, verbose, env.as_deref());
    let filter = EnvFilter::try_new(&directives)
        .with_context(|| format!("invalid log filter {directives:?} (check {LOG_ENV})"))?;

    fmt()
        .compact()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

fn verbosity(count: u8) -> Option<LevelFilter> {
    match count {
        0 => None,
        1 => Some(LevelFilter::DEBUG),
        _ => Some(LevelFilter::TRACE),
    }
}

/// Our own crate at `level`, dependencies never louder than `warn`.
fn crate_directives(level: LevelFilter) -> String {
    let others = level.min(LevelFilter::WARN);
    format!(
        "{},spotrun={}",
        others.to_string().to_lowercase(),
        level.to_string().to_lowercase()
    )
}

fn directives(cli_level: Option<LogLevel>, verbose: u8, env: Option<&str>) -> String {
    if let Some(level) = cli_level.map(LevelFilter::from).or_else(|| verbosity(verbose)) {
        return crate_directives(level);
    }
    match env.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw.to_string(),
        None => crate_directives(LevelFilter::INFO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_beats_verbosity_and_env() {
        assert_eq!(
            directives(Some(LogLevel::Error), 2, Some("trace")),
            "error,spotrun=error"
        );
        assert_eq!(directives(None, 1, Some("trace")), "warn,spotrun=debug");
        assert_eq!(directives(None, 3, None), "warn,spotrun=trace");
    }

    #[test]
    fn env_is_taken_verbatim() {
        assert_eq!(
            directives(None, 0, Some(" spotrun=debug,aws_config=info ")),
            "spotrun=debug,aws_config=info"
        );
        assert_eq!(directives(None, 0, Some("  ")), "warn,spotrun=info");
        assert_eq!(directives(None, 0, None), "warn,spotrun=info");
    }

    #[test]
    fn every_default_parses() {
        for verbose in 0..3 {
            let d = directives(None, verbose, None);
            assert!(EnvFilter::try_new(&d).is_ok(), "{d}");
        }
    }
}
