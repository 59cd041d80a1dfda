use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use spotrun::errors::{Result, SpotrunError};
use spotrun::provider::BoxFuture;
use spotrun::remote::{RemoteConnector, RemoteExecutor, RemoteOutput, RunMode, StopSignal};

/// One recorded remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Run { command: String, mode: RunMode },
    PushFile { local: PathBuf, remote: String },
    RsyncTo { local: PathBuf, remote: String },
    RsyncProject { local_root: PathBuf, remote_root: String, excludes: Vec<String> },
}

#[derive(Default)]
struct Replies {
    /// Exit codes handed out in order; `0` once exhausted.
    exit_codes: VecDeque<i32>,
    /// Stdout for `Capture` runs, in order; empty once exhausted.
    captures: VecDeque<String>,
    wait_for_stop: bool,
}

/// A [`RemoteExecutor`] that records calls instead of talking to a host.
#[derive(Clone, Default)]
pub struct FakeRemote {
    calls: Arc<Mutex<Vec<RemoteCall>>>,
    replies: Arc<Mutex<Replies>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_codes(self, codes: &[i32]) -> Self {
        self.replies.lock().unwrap().exit_codes.extend(codes);
        self
    }

    pub fn with_captures(self, outputs: &[&str]) -> Self {
        self.replies
            .lock()
            .unwrap()
            .captures
            .extend(outputs.iter().map(|s| s.to_string()));
        self
    }

    /// Runs given a stop signal block until it fires.
    pub fn wait_for_stop(self) -> Self {
        self.replies.lock().unwrap().wait_for_stop = true;
        self
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Commands passed to `run_remote`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::Run { command, .. } => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl RemoteExecutor for FakeRemote {
    fn run_remote<'a>(
        &'a self,
        command: &'a str,
        mode: RunMode,
        stop: Option<StopSignal>,
    ) -> BoxFuture<'a, Result<RemoteOutput>> {
        Box::pin(async move {
            self.record(RemoteCall::Run {
                command: command.to_string(),
                mode,
            });

            let wait = self.replies.lock().unwrap().wait_for_stop;
            if let (true, Some(stop)) = (wait, stop) {
                if stop.await.is_ok() {
                    return Ok(RemoteOutput::Cancelled);
                }
            }

            let mut replies = self.replies.lock().unwrap();
            if mode == RunMode::Capture {
                return Ok(RemoteOutput::Captured(
                    replies.captures.pop_front().unwrap_or_default(),
                ));
            }
            Ok(RemoteOutput::Exit(replies.exit_codes.pop_front().unwrap_or(0)))
        })
    }

    fn push_file<'a>(&'a self, local: &'a Path, remote_path: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(RemoteCall::PushFile {
                local: local.to_path_buf(),
                remote: remote_path.to_string(),
            });
            Ok(())
        })
    }

    fn rsync_to<'a>(
        &'a self,
        local: &'a Path,
        remote_path: &'a str,
        _quiet: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(RemoteCall::RsyncTo {
                local: local.to_path_buf(),
                remote: remote_path.to_string(),
            });
            Ok(())
        })
    }

    fn rsync_project<'a>(
        &'a self,
        local_root: &'a Path,
        remote_root: &'a str,
        excludes: &'a [String],
        _quiet: bool,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.record(RemoteCall::RsyncProject {
                local_root: local_root.to_path_buf(),
                remote_root: remote_root.to_string(),
                excludes: excludes.to_vec(),
            });
            Ok(())
        })
    }

    fn exec_interactive(&self) -> SpotrunError {
        SpotrunError::RemoteError("interactive shell is not available in tests".to_string())
    }
}

/// Hands out one shared [`FakeRemote`] and records who connected.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub remote: FakeRemote,
    connections: Arc<Mutex<Vec<(String, PathBuf)>>>,
}

impl FakeConnector {
    pub fn new(remote: FakeRemote) -> Self {
        Self {
            remote,
            connections: Arc::default(),
        }
    }

    /// (host, key path) of every connection, in order.
    pub fn connections(&self) -> Vec<(String, PathBuf)> {
        self.connections.lock().unwrap().clone()
    }
}

impl RemoteConnector for FakeConnector {
    fn connect(&self, host: &str, key_path: &Path) -> Arc<dyn RemoteExecutor> {
        self.connections
            .lock()
            .unwrap()
            .push((host.to_string(), key_path.to_path_buf()));
        Arc::new(self.remote.clone())
    }
}
