// src/remote/ssh.rs

//! `ssh`/`rsync`/`scp` backed remote executor.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::errors::{Result, SpotrunError};
use crate::provider::BoxFuture;
use crate::remote::sync::{build_excludes, dir_size, fmt_size, parse_progress2};
use crate::remote::{
    shell_quote, RemoteConnector, RemoteExecutor, RemoteOutput, RunMode, StopSignal,
};

/// How long a cancelled command gets to exit after SIGTERM.
pub const CANCEL_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_COLUMNS: u16 = 120;

#[derive(Debug, Clone)]
pub struct SshRemote {
    host: String,
    user: String,
    key_path: PathBuf,
    known_hosts: PathBuf,
}

impl SshRemote {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<PathBuf>,
        known_hosts: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: key_path.into(),
            known_hosts: known_hosts.into(),
        }
    }

    pub fn target(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh`, `scp` and the rsync transport.
    ///
    /// Host keys of fresh instances are accepted on first use and kept in a
    /// spotrun-private known_hosts file.
    pub fn ssh_opts(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]
    }

    /// The `-e` argument for rsync.
    fn rsync_shell(&self) -> String {
        let opts: Vec<String> = self.ssh_opts().iter().map(|o| shell_quote(o)).collect();
        format!("ssh {}", opts.join(" "))
    }

    pub fn rsync_to_args(&self, local: &Path, remote_path: &str, quiet: bool) -> Vec<String> {
        let mut args = vec!["-az".to_string()];
        if !quiet {
            args.push("--info=progress2".to_string());
        }
        args.push("-e".to_string());
        args.push(self.rsync_shell());
        args.push(local.display().to_string());
        args.push(format!("{}:{}", self.target(), remote_path));
        args
    }

    pub fn rsync_project_args(
        &self,
        local_root: &Path,
        remote_root: &str,
        excludes: &[String],
        quiet: bool,
    ) -> Vec<String> {
        let mut args = vec!["-az".to_string()];
        if !quiet {
            args.push("--info=progress2".to_string());
        }
        args.push("-e".to_string());
        args.push(self.rsync_shell());
        for exclude in excludes {
            args.push("--exclude".to_string());
            args.push(exclude.clone());
        }
        // Trailing slash: sync the contents, not the directory itself.
        let local = format!("{}/", local_root.display().to_string().trim_end_matches('/'));
        args.push(local);
        args.push(format!("{}:{}", self.target(), remote_root));
        args
    }

    fn ssh_command(&self, tty: bool, remote_cmd: &str) -> Command {
        let mut cmd = Command::new("ssh");
        if tty {
            cmd.arg("-t");
        }
        cmd.args(self.ssh_opts())
            .arg(self.target())
            .arg(remote_cmd)
            .kill_on_drop(true);
        cmd
    }

    async fn run_inner(
        &self,
        command: &str,
        mode: RunMode,
        stop: Option<StopSignal>,
    ) -> Result<RemoteOutput> {
        debug!(host = %self.host, ?mode, cmd = %command, "running remote command");
        match mode {
            RunMode::Capture => {
                let output = self
                    .ssh_command(false, command)
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| spawn_error("ssh", e))?;
                if !output.status.success() {
                    return Err(SpotrunError::RemoteError(format!(
                        "command exited with code {}: {}",
                        output.status.code().unwrap_or(-1),
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
                Ok(RemoteOutput::Captured(
                    String::from_utf8_lossy(&output.stdout).into_owned(),
                ))
            }
            RunMode::Quiet => {
                let child = self
                    .ssh_command(false, command)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| spawn_error("ssh", e))?;
                wait_or_stop(child, stop).await
            }
            RunMode::Stream => {
                // Remote progress bars render at the local terminal width.
                let columns = std::env::var("COLUMNS")
                    .ok()
                    .and_then(|c| c.parse::<u16>().ok())
                    .unwrap_or(DEFAULT_COLUMNS);
                let wrapped = format!("export COLUMNS={columns}; {command}");
                let child = self
                    .ssh_command(true, &wrapped)
                    .spawn()
                    .map_err(|e| spawn_error("ssh", e))?;
                wait_or_stop(child, stop).await
            }
        }
    }

    async fn rsync_with_progress(&self, args: Vec<String>, total_bytes: Option<u64>) -> Result<()> {
        let mut child = Command::new("rsync")
            .args(&args)
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error("rsync", e))?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut last_percent = 0u8;
            while let Ok(Some(line)) = lines.next_line().await {
                // progress2 separates updates with carriage returns.
                for part in line.split('\r') {
                    if let Some(p) = parse_progress2(part) {
                        if p.percent >= last_percent.saturating_add(10) || p.percent == 100 {
                            last_percent = p.percent;
                            info!(
                                transferred = %fmt_size(p.bytes),
                                total = ?total_bytes.map(fmt_size),
                                percent = p.percent,
                                "sync progress"
                            );
                        }
                    }
                }
            }
        }

        let status = child.wait().await?;
        check_status("rsync", status.code())
    }
}

impl RemoteExecutor for SshRemote {
    fn run_remote<'a>(
        &'a self,
        command: &'a str,
        mode: RunMode,
        stop: Option<StopSignal>,
    ) -> BoxFuture<'a, Result<RemoteOutput>> {
        Box::pin(self.run_inner(command, mode, stop))
    }

    fn push_file<'a>(&'a self, local: &'a Path, remote_path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let status = Command::new("scp")
                .args(self.ssh_opts())
                .arg(local)
                .arg(format!("{}:{}", self.target(), remote_path))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await
                .map_err(|e| spawn_error("scp", e))?;
            check_status("scp", status.code())
        })
    }

    fn rsync_to<'a>(
        &'a self,
        local: &'a Path,
        remote_path: &'a str,
        quiet: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let args = self.rsync_to_args(local, remote_path, quiet);
            if quiet {
                let status = Command::new("rsync")
                    .args(&args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await
                    .map_err(|e| spawn_error("rsync", e))?;
                return check_status("rsync", status.code());
            }
            info!(local = %local.display(), remote = %remote_path, "rsync");
            self.rsync_with_progress(args, None).await
        })
    }

    fn rsync_project<'a>(
        &'a self,
        local_root: &'a Path,
        remote_root: &'a str,
        excludes: &'a [String],
        quiet: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let args = self.rsync_project_args(local_root, remote_root, excludes, quiet);
            if quiet {
                let status = Command::new("rsync")
                    .args(&args)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .status()
                    .await
                    .map_err(|e| spawn_error("rsync", e))?;
                return check_status("rsync", status.code());
            }
            let total = dir_size(local_root, &build_excludes(excludes)?);
            info!(
                local = %local_root.display(),
                remote = %remote_root,
                size = %fmt_size(total),
                "syncing project"
            );
            self.rsync_with_progress(args, Some(total)).await
        })
    }

    fn exec_interactive(&self) -> SpotrunError {
        let err = std::process::Command::new("ssh")
            .args(self.ssh_opts())
            .arg(self.target())
            .exec();
        SpotrunError::RemoteError(format!("failed to exec ssh: {err}"))
    }
}

/// Builds [`SshRemote`]s that share one user and known_hosts file.
#[derive(Debug, Clone)]
pub struct SshConnector {
    user: String,
    known_hosts: PathBuf,
}

impl SshConnector {
    pub fn new(user: impl Into<String>, known_hosts: impl Into<PathBuf>) -> Self {
        Self {
            user: user.into(),
            known_hosts: known_hosts.into(),
        }
    }
}

impl RemoteConnector for SshConnector {
    fn connect(&self, host: &str, key_path: &Path) -> Arc<dyn RemoteExecutor> {
        Arc::new(SshRemote::new(
            host,
            self.user.clone(),
            key_path,
            self.known_hosts.clone(),
        ))
    }
}

fn spawn_error(program: &str, err: std::io::Error) -> SpotrunError {
    SpotrunError::RemoteError(format!("failed to start {program}: {err}"))
}

fn check_status(program: &str, code: Option<i32>) -> Result<()> {
    match code {
        Some(0) => Ok(()),
        Some(code) => Err(SpotrunError::RemoteError(format!(
            "{program} exited with code {code}"
        ))),
        None => Err(SpotrunError::RemoteError(format!(
            "{program} was terminated by a signal"
        ))),
    }
}

/// Wait for `child`, or stop it when `stop` fires.
///
/// A dropped stop sender is not a stop request; the child keeps running.
async fn wait_or_stop(mut child: Child, stop: Option<StopSignal>) -> Result<RemoteOutput> {
    let Some(mut stop) = stop else {
        let status = child.wait().await?;
        return Ok(RemoteOutput::Exit(status.code().unwrap_or(-1)));
    };

    tokio::select! {
        status = child.wait() => {
            Ok(RemoteOutput::Exit(status?.code().unwrap_or(-1)))
        }
        res = &mut stop => {
            match res {
                Ok(()) => {
                    info!("stop requested; terminating remote command");
                    terminate_gracefully(&mut child, CANCEL_GRACE).await?;
                    Ok(RemoteOutput::Cancelled)
                }
                Err(_) => {
                    debug!("stop channel closed without a request");
                    let status = child.wait().await?;
                    Ok(RemoteOutput::Exit(status.code().unwrap_or(-1)))
                }
            }
        }
    }
}

/// SIGTERM, then SIGKILL once `grace` has passed.
pub(crate) async fn terminate_gracefully(child: &mut Child, grace: Duration) -> Result<()> {
    if let Some(pid) = child.id().and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            warn!(pid, error = %e, "failed to send SIGTERM");
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            let status = status?;
            debug!(?status, "process exited after SIGTERM");
        }
        Err(_) => {
            warn!(grace_secs = grace.as_secs(), "process ignored SIGTERM; killing");
            child.kill().await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SshRemote {
        SshRemote::new("203.0.113.7", "ubuntu", "/keys/a b.pem", "/home/u/.spotrun/known_hosts")
    }

    #[test]
    fn ssh_opts_pin_key_and_known_hosts() {
        let opts = remote().ssh_opts();
        assert_eq!(opts[0], "-i");
        assert_eq!(opts[1], "/keys/a b.pem");
        assert!(opts.contains(&"StrictHostKeyChecking=accept-new".to_string()));
        assert!(opts.contains(&"UserKnownHostsFile=/home/u/.spotrun/known_hosts".to_string()));
    }

    #[test]
    fn project_args_sync_contents_with_excludes() {
        let args = remote().rsync_project_args(
            Path::new("/work/proj/"),
            "/opt/project",
            &[".git".to_string(), "*.pyc".to_string()],
            true,
        );
        assert!(!args.contains(&"--info=progress2".to_string()));
        let shell = &args[args.iter().position(|a| a == "-e").unwrap() + 1];
        assert!(shell.starts_with("ssh -i '/keys/a b.pem'"));
        assert_eq!(args[args.len() - 2], "/work/proj/");
        assert_eq!(args[args.len() - 1], "ubuntu@203.0.113.7:/opt/project");
        let excludes: Vec<_> = args
            .windows(2)
            .filter(|w| w[0] == "--exclude")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(excludes, vec![".git", "*.pyc"]);
    }

    #[tokio::test]
    async fn stop_signal_terminates_child() {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tx.send(()).unwrap();
        let out = tokio::time::timeout(Duration::from_secs(5), wait_or_stop(child, Some(rx)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out, RemoteOutput::Cancelled);
    }

    #[tokio::test]
    async fn dropped_stop_sender_lets_child_finish() {
        let child = Command::new("true").spawn().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        drop(tx);
        let out = wait_or_stop(child, Some(rx)).await.unwrap();
        assert_eq!(out, RemoteOutput::Exit(0));
    }
}
