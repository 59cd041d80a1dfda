// tests/watchdog_script.rs
//
// Runs the rendered watchdog loop under bash with `sudo` and `pgrep` replaced
// by stubs on PATH. The `pgrep` stub matches the pattern against the command
// line of the process that called it (the watchdog itself), plus a fake login
// switch, so a pattern that matches its own script text keeps the loop alive
// forever.

mod common;

use std::error::Error;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::{sleep, Instant};

use spotrun::watchdog::WatchdogScript;

use crate::common::init_tracing;

type TestResult = Result<(), Box<dyn Error>>;

struct Harness {
    dir: TempDir,
    bin: PathBuf,
    shutdown_marker: PathBuf,
    login_switch: PathBuf,
    heartbeat: PathBuf,
}

fn write_executable(path: &Path, body: &str) -> std::io::Result<()> {
    fs::write(path, body)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

fn harness() -> Result<Harness, Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let bin = dir.path().join("bin");
    fs::create_dir(&bin)?;
    let shutdown_marker = dir.path().join("shutdown-called");
    let login_switch = dir.path().join("login-active");
    let heartbeat = dir.path().join("heartbeat");

    write_executable(
        &bin.join("sudo"),
        &format!("#!/bin/sh\necho \"$*\" > {}\n", shutdown_marker.display()),
    )?;
    write_executable(
        &bin.join("pgrep"),
        &format!(
            r#"#!/bin/sh
for a; do pat=$a; done
[ -f {login} ] && exit 0
if [ -r /proc/$PPID/cmdline ]; then
  tr '\000' ' ' < /proc/$PPID/cmdline
else
  ps -o args= -p "$PPID"
fi | grep -E -- "$pat" > /dev/null
"#,
            login = login_switch.display()
        ),
    )?;

    Ok(Harness {
        dir,
        bin,
        shutdown_marker,
        login_switch,
        heartbeat,
    })
}

fn spawn_watchdog(h: &Harness, idle_secs: u64) -> Result<Child, Box<dyn Error>> {
    let heartbeat = h.heartbeat.to_str().ok_or("non-utf8 temp path")?;
    let script = WatchdogScript::new(Duration::from_secs(idle_secs), heartbeat)?;
    let path = format!(
        "{}:{}",
        h.bin.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    let child = Command::new("bash")
        .arg("-c")
        .arg(script.render())
        .env("PATH", path)
        .current_dir(h.dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

async fn shutdown_within(marker: &Path, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if marker.exists() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    marker.exists()
}

#[tokio::test]
async fn idle_instance_shuts_down() -> TestResult {
    init_tracing();
    let h = harness()?;
    let mut child = spawn_watchdog(&h, 1)?;

    let fired = shutdown_within(&h.shutdown_marker, Duration::from_secs(5)).await;
    child.kill().await?;

    assert!(fired, "watchdog never called shutdown");
    assert_eq!(fs::read_to_string(&h.shutdown_marker)?.trim(), "shutdown -h now");
    Ok(())
}

#[tokio::test]
async fn active_login_keeps_instance_alive() -> TestResult {
    init_tracing();
    let h = harness()?;
    fs::write(&h.login_switch, "")?;
    let mut child = spawn_watchdog(&h, 1)?;

    let fired = shutdown_within(&h.shutdown_marker, Duration::from_secs(3)).await;
    child.kill().await?;

    assert!(!fired);
    Ok(())
}

// The age check uses GNU `stat -c`.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn fresh_heartbeat_keeps_instance_alive() -> TestResult {
    init_tracing();
    let h = harness()?;
    fs::write(&h.heartbeat, "")?;
    let heartbeat = h.heartbeat.clone();
    let toucher = tokio::spawn(async move {
        loop {
            let _ = fs::write(&heartbeat, "");
            sleep(Duration::from_millis(200)).await;
        }
    });
    let mut child = spawn_watchdog(&h, 2)?;

    let fired = shutdown_within(&h.shutdown_marker, Duration::from_secs(5)).await;
    toucher.abort();
    child.kill().await?;

    assert!(!fired);
    Ok(())
}
