// src/watchdog/mod.rs

//! Remote idle-shutdown watchdog.
//!
//! The watchdog is a shell loop that runs detached on the instance itself, so
//! it keeps working after the controlling process disconnects or crashes.
//! Every `idle_timeout` seconds it checks two liveness signals:
//!
//! - an active SSH login (`sshd: user@...` process),
//! - a heartbeat file modified less than `idle_timeout` seconds ago.
//!
//! If neither is present the instance shuts itself down. Long unattended jobs
//! keep the instance alive by touching the heartbeat file, e.g.
//!
//! ```text
//! (while true; do touch /tmp/spotrun-heartbeat; sleep 30; done) &
//! ```
//!
//! The loop lives in `idle_watchdog.sh.tmpl`; [`IdleDecision::evaluate`] is the
//! same decision in Rust.

use std::time::Duration;

use tracing::{debug, info};

use crate::errors::{Result, SpotrunError};
use crate::remote::{RemoteExecutor, RunMode};

pub const DEFAULT_HEARTBEAT_FILE: &str = "/tmp/spotrun-heartbeat";

const TEMPLATE: &str = include_str!("idle_watchdog.sh.tmpl");
const TIMEOUT_PLACEHOLDER: &str = "{{IDLE_TIMEOUT}}";
const HEARTBEAT_PLACEHOLDER: &str = "{{HEARTBEAT_FILE}}";

/// Outcome of one watchdog check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    KeepAlive,
    Shutdown,
}

impl IdleDecision {
    /// `marker_age` is `None` when the heartbeat file does not exist.
    pub fn evaluate(ssh_active: bool, marker_age: Option<Duration>, timeout: Duration) -> Self {
        if ssh_active {
            return IdleDecision::KeepAlive;
        }
        match marker_age {
            Some(age) if age < timeout => IdleDecision::KeepAlive,
            _ => IdleDecision::Shutdown,
        }
    }
}

/// A validated watchdog configuration, ready to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogScript {
    idle_timeout_secs: u64,
    heartbeat_file: String,
}

impl WatchdogScript {
    pub fn new(idle_timeout: Duration, heartbeat_file: impl Into<String>) -> Result<Self> {
        let idle_timeout_secs = idle_timeout.as_secs();
        if idle_timeout_secs == 0 {
            return Err(SpotrunError::InvalidRequest(
                "idle timeout must be at least one second".to_string(),
            ));
        }
        let heartbeat_file = heartbeat_file.into();
        validate_heartbeat_path(&heartbeat_file)?;
        Ok(Self {
            idle_timeout_secs,
            heartbeat_file,
        })
    }

    pub fn idle_timeout_secs(&self) -> u64 {
        self.idle_timeout_secs
    }

    pub fn heartbeat_file(&self) -> &str {
        &self.heartbeat_file
    }

    /// The loop with placeholders substituted.
    pub fn render(&self) -> String {
        TEMPLATE
            .replace(TIMEOUT_PLACEHOLDER, &self.idle_timeout_secs.to_string())
            .replace(HEARTBEAT_PLACEHOLDER, &self.heartbeat_file)
    }

    /// Remote command that starts the loop detached from the SSH session.
    pub fn launch_command(&self) -> String {
        format!("nohup bash -c '{}' >/dev/null 2>&1 &", self.render())
    }
}

/// Absolute path made only of characters that need no shell quoting.
pub fn validate_heartbeat_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(SpotrunError::InvalidRequest(format!(
            "heartbeat file must be an absolute path: {path}"
        )));
    }
    let safe = path
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'));
    if !safe {
        return Err(SpotrunError::InvalidRequest(format!(
            "heartbeat file contains characters that are not shell-safe: {path}"
        )));
    }
    Ok(())
}

/// Start the watchdog on the instance behind `remote`.
///
/// A zero `idle_timeout` disables the watchdog; returns whether one was
/// installed.
pub async fn install(
    remote: &dyn RemoteExecutor,
    idle_timeout: Duration,
    heartbeat_file: &str,
) -> Result<bool> {
    if idle_timeout.is_zero() {
        debug!("idle watchdog disabled");
        return Ok(false);
    }
    let script = WatchdogScript::new(idle_timeout, heartbeat_file)?;
    let output = remote
        .run_remote(&script.launch_command(), RunMode::Quiet, None)
        .await?;
    match output.exit_code() {
        0 => {
            info!(
                idle_timeout_secs = script.idle_timeout_secs(),
                heartbeat = %script.heartbeat_file(),
                "idle watchdog installed"
            );
            Ok(true)
        }
        code => Err(SpotrunError::RemoteError(format!(
            "installing idle watchdog exited with code {code}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIXTY: Duration = Duration::from_secs(60);

    #[test]
    fn recent_marker_keeps_instance_alive() {
        let d = IdleDecision::evaluate(false, Some(Duration::from_secs(30)), SIXTY);
        assert_eq!(d, IdleDecision::KeepAlive);
    }

    #[test]
    fn stale_marker_without_ssh_shuts_down() {
        let d = IdleDecision::evaluate(false, Some(Duration::from_secs(61)), SIXTY);
        assert_eq!(d, IdleDecision::Shutdown);
        // The script compares with -lt, so exactly the timeout is stale too.
        let d = IdleDecision::evaluate(false, Some(SIXTY), SIXTY);
        assert_eq!(d, IdleDecision::Shutdown);
    }

    #[test]
    fn ssh_login_overrides_missing_marker() {
        assert_eq!(IdleDecision::evaluate(true, None, SIXTY), IdleDecision::KeepAlive);
        assert_eq!(IdleDecision::evaluate(false, None, SIXTY), IdleDecision::Shutdown);
    }

    #[test]
    fn template_has_every_placeholder_and_no_single_quotes() {
        assert!(TEMPLATE.contains(TIMEOUT_PLACEHOLDER));
        assert!(TEMPLATE.contains(HEARTBEAT_PLACEHOLDER));
        assert!(!TEMPLATE.contains('\''));
    }

    #[test]
    fn rendered_script_checks_both_signals_before_shutdown() {
        let script = WatchdogScript::new(SIXTY, DEFAULT_HEARTBEAT_FILE).unwrap();
        let rendered = script.render();

        assert!(!rendered.contains("{{"));
        assert!(rendered.contains("HB=/tmp/spotrun-heartbeat"));
        assert!(rendered.contains("TIMEOUT=60"));

        let ssh_check = rendered.find("pgrep -f \"[s]shd:.*@\"").unwrap();
        let age_check = rendered.find("[ \"$age\" -lt \"$TIMEOUT\" ] && continue").unwrap();
        let shutdown = rendered.find("sudo shutdown -h now").unwrap();
        assert!(ssh_check < shutdown);
        assert!(age_check < shutdown);

        let cmd = script.launch_command();
        assert!(cmd.starts_with("nohup bash -c '"));
        assert!(cmd.ends_with("' >/dev/null 2>&1 &"));
    }

    #[test]
    fn login_pattern_does_not_match_the_watchdog_itself() {
        let script = WatchdogScript::new(SIXTY, DEFAULT_HEARTBEAT_FILE).unwrap();
        let rendered = script.render();

        let start = rendered.find("pgrep -f \"").unwrap() + "pgrep -f \"".len();
        let len = rendered[start..].find('"').unwrap();
        let pattern = regex::Regex::new(&rendered[start..start + len]).unwrap();

        assert!(pattern.is_match("sshd: ubuntu@pts/0"));
        assert!(pattern.is_match("sshd: ubuntu@notty"));
        assert!(!pattern.is_match("sshd: /usr/sbin/sshd -D [listener]"));
        // pgrep -f sees the full `bash -c '<script>'` command line.
        assert!(!pattern.is_match(&script.launch_command()));
        assert!(!pattern.is_match(&format!("bash -c {rendered}")));
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(WatchdogScript::new(Duration::ZERO, DEFAULT_HEARTBEAT_FILE).is_err());
        assert!(WatchdogScript::new(SIXTY, "tmp/hb").is_err());
        assert!(WatchdogScript::new(SIXTY, "/tmp/hb; reboot").is_err());
        assert!(WatchdogScript::new(SIXTY, "/tmp/it's").is_err());
        assert!(WatchdogScript::new(SIXTY, "/var/run/job-1.hb").is_ok());
    }
}
