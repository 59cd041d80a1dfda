// src/remote/mod.rs

//! Remote execution on the acquired instance.
//!
//! The session talks to a [`RemoteExecutor`] instead of spawning `ssh`
//! itself. [`SshRemote`] is the production implementation; tests provide a
//! recording fake.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::errors::{Result, SpotrunError};
use crate::provider::BoxFuture;

pub mod ssh;
pub mod sync;

pub use ssh::{SshConnector, SshRemote};

/// Fires when the caller wants a running remote command stopped.
pub type StopSignal = oneshot::Receiver<()>;

/// How output of a remote command is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Attach to the local terminal.
    Stream,
    /// Discard all output.
    Quiet,
    /// Collect stdout and return it.
    Capture,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutput {
    Exit(i32),
    Captured(String),
    /// The stop signal fired before the command finished.
    Cancelled,
}

impl RemoteOutput {
    pub fn exit_code(&self) -> i32 {
        match self {
            RemoteOutput::Exit(code) => *code,
            RemoteOutput::Captured(_) => 0,
            RemoteOutput::Cancelled => -1,
        }
    }
}

pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command on the instance.
    ///
    /// In `Capture` mode a non-zero exit is an error. In the other modes the
    /// exit code is returned as [`RemoteOutput::Exit`].
    fn run_remote<'a>(
        &'a self,
        command: &'a str,
        mode: RunMode,
        stop: Option<StopSignal>,
    ) -> BoxFuture<'a, Result<RemoteOutput>>;

    /// Copy one local file to `remote_path`.
    fn push_file<'a>(&'a self, local: &'a Path, remote_path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Rsync a local file or directory to `remote_path`.
    fn rsync_to<'a>(
        &'a self,
        local: &'a Path,
        remote_path: &'a str,
        quiet: bool,
    ) -> BoxFuture<'a, Result<()>>;

    /// Rsync the contents of `local_root` into `remote_root`, skipping
    /// `excludes`.
    fn rsync_project<'a>(
        &'a self,
        local_root: &'a Path,
        remote_root: &'a str,
        excludes: &'a [String],
        quiet: bool,
    ) -> BoxFuture<'a, Result<()>>;

    /// Replace the current process with an interactive shell on the
    /// instance.
    ///
    /// Does not return on success. The returned error is the only
    /// observable outcome: the replacement could not even be started.
    fn exec_interactive(&self) -> SpotrunError;
}

/// Opens a [`RemoteExecutor`] for a freshly acquired instance.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, host: &str, key_path: &Path) -> Arc<dyn RemoteExecutor>;
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-' | '=' | ':' | ',' | '@' | '+'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}
