//! The `hatd` daemon binary: wires the IPC transport, the daemon front,
//! and the runner together under one `tokio` runtime.
//!
//! Grounded on `original_source/hat/daemon_front.py`'s `__main__` block
//! (pid file write, perpetual `run()` loop) and `daemon.py::HatDaemon.
//! start`, with the FIFO-in-a-blocking-thread pattern standard for
//! bridging a synchronous named-pipe read into an async runtime: the
//! runner's own 100ms `tokio::time::interval` tick (unlike the original's
//! blocking FIFO read) means no startup "kick" message is needed — the
//! first tick fires against the restored snapshot on its own.

use hatd::config::HatPaths;
use hatd::ipc;
use hatd::runner::{self, RunnerRequest};
use hatd::{daemon_front, logging, supervisor};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();
    let paths = HatPaths::system();
    supervisor::repair_startup(&paths);

    let store = hatd::store::Store::load(&paths.snapshot_file(), &paths.lock_file_for(&paths.snapshot_file()))
        .unwrap_or_default();

    let _ = ipc::append_dated_line(&paths.daemon_log(), &format!("Daemon started: PID {}", std::process::id()));
    ipc::write_pid_file(&paths.pid_file(), std::process::id())?;

    let (runner_tx, runner_rx) = mpsc::channel::<RunnerRequest>(256);
    let mut runner_handle = tokio::spawn(runner::run(store, runner_rx, paths.clone()));

    let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
    let in_path = paths.daemon_in();
    std::thread::spawn(move || read_loop(in_path, line_tx));

    let out_path = paths.daemon_out();
    loop {
        tokio::select! {
            result = &mut runner_handle => {
                if let Err(e) = result {
                    warn!("runner task panicked: {e}");
                }
                info!("runner stopped, daemon exiting");
                break;
            }
            maybe_line = line_rx.recv() => {
                let Some(line) = maybe_line else { break };
                if let Some(reply) = daemon_front::dispatch(&line, &runner_tx).await {
                    let reply_line = reply.to_string();
                    let out_path = out_path.clone();
                    let _ = tokio::task::spawn_blocking(move || ipc::write_one_line(&out_path, &reply_line)).await;
                }
            }
        }
    }

    let _ = ipc::append_dated_line(&paths.daemon_log(), "Daemon stopped");
    let _ = std::fs::remove_file(paths.pid_file());
    Ok(())
}

fn read_loop(path: std::path::PathBuf, line_tx: mpsc::Sender<String>) {
    loop {
        match ipc::read_one_line(&path) {
            Ok(Some(line)) if !line.trim().is_empty() => {
                if line_tx.blocking_send(line).is_err() {
                    return;
                }
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("failed to read inbound line: {e}");
                std::thread::sleep(ipc::retry_delay());
            }
        }
    }
}
