//! Process lifecycle management for the `hatd` daemon.
//!
//! Grounded on `original_source/hat/daemon.py` (`HatDaemon.start/stop/
//! status`) and `original_source/hat/client.py::check_daemon_process`.
//! The original's `multiprocessing.Process` + `kill -9` pair becomes a
//! plain `std::process::Command` spawn plus a POSIX `kill()` FFI shim,
//! the same kind of signal call `src/act/job_manager.rs::libc_kill` makes
//! in the teacher for killing a background job.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::config::{HatPaths, STARTUP_GRACE_SECS};
use crate::ipc;

/// Starts the daemon binary as a detached child process, records its pid,
/// and verifies it is still alive after a short grace period.
///
/// `hatd_binary` is the path to the daemon executable (usually
/// `std::env::current_exe()`'s sibling `hatd`, resolved by the caller).
pub fn start(paths: &HatPaths, hatd_binary: &Path) -> Result<()> {
    repair_startup(paths);

    if status(paths) {
        bail!("hatd is already running");
    }

    let child = std::process::Command::new(hatd_binary)
        .spawn()
        .with_context(|| format!("failed to spawn {}", hatd_binary.display()))?;
    let pid = child.id();
    // We never `wait()` on `child`: once this process exits the daemon
    // reparents to init, which reaps it — the standard detach technique.
    drop(child);

    ipc::write_pid_file(&paths.pid_file(), pid).context("failed to write pid file")?;
    info!("hatd started: pid {pid}");

    std::thread::sleep(Duration::from_secs(STARTUP_GRACE_SECS));
    if !status(paths) {
        bail!("hatd exited immediately after starting");
    }
    Ok(())
}

/// Requests a graceful stop by writing `{"stop":true}` to the daemon's
/// inbound channel, then escalates to `SIGTERM` and finally `SIGKILL` if
/// the process is still alive after the daemon's own tick-boundary exit
/// should have happened.
pub fn stop(paths: &HatPaths) -> Result<()> {
    let Some(pid) = ipc::read_pid_file(&paths.pid_file()) else {
        bail!("hatd is not running");
    };

    let _ = ipc::write_one_line(&paths.daemon_in(), r#"{"stop":true}"#);
    std::thread::sleep(Duration::from_millis(1500));

    if status(paths) {
        warn!("hatd still alive after cooperative stop, sending SIGTERM");
        send_signal(pid, 15);
        std::thread::sleep(Duration::from_millis(500));
    }
    if status(paths) {
        warn!("hatd still alive after SIGTERM, sending SIGKILL");
        send_signal(pid, 9);
    }
    let _ = std::fs::remove_file(paths.pid_file());
    Ok(())
}

/// True when the pid file names a process whose `/proc/<pid>/cmdline`
/// still looks like the daemon binary, mirroring
/// `client.py::check_daemon_process`'s `ps -p <pid> -o cmd=` check.
pub fn status(paths: &HatPaths) -> bool {
    let Some(pid) = ipc::read_pid_file(&paths.pid_file()) else {
        return false;
    };
    process_cmdline_matches(pid, "hatd")
}

#[cfg(target_os = "linux")]
fn process_cmdline_matches(pid: u32, needle: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => cmdline.split('\0').next().map(|c| c.contains(needle)).unwrap_or(false),
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn process_cmdline_matches(pid: u32, _needle: &str) -> bool {
    // Best effort outside Linux: absence of an error on signal 0 means
    // the process exists, though we can't verify its command line.
    send_signal_probe(pid)
}

#[cfg(not(target_os = "linux"))]
fn send_signal_probe(pid: u32) -> bool {
    unsafe { libc_kill(pid as i32, 0) == 0 }
}

/// Clears an orphaned pid file left behind by a daemon that died without
/// cleaning up after itself, per spec.md §7's "supervisor-level faults"
/// repair policy. Called both by [`start`] and by the daemon itself on
/// boot, before its runner loop begins.
pub fn repair_startup(paths: &HatPaths) {
    if let Some(pid) = ipc::read_pid_file(&paths.pid_file()) {
        if !process_cmdline_matches(pid, "hatd") {
            info!("clearing orphaned pid file for dead pid {pid}");
            let _ = std::fs::remove_file(paths.pid_file());
        }
    }
}

fn send_signal(pid: u32, sig: i32) {
    unsafe {
        libc_kill(pid as i32, sig);
    }
}

extern "C" {
    #[link_name = "kill"]
    fn libc_kill(pid: i32, sig: i32) -> i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_false_without_a_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HatPaths::under(dir.path());
        assert!(!status(&paths));
    }

    #[test]
    fn repair_startup_clears_a_dead_pid() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HatPaths::under(dir.path());
        // A pid essentially guaranteed not to be a running `hatd`.
        ipc::write_pid_file(&paths.pid_file(), 999_999).unwrap();
        repair_startup(&paths);
        assert!(ipc::read_pid_file(&paths.pid_file()).is_none());
    }
}
