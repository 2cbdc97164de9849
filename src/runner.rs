//! The runner: owns the job store exclusively and drives the 100ms tick
//! loop that fires due jobs.
//!
//! Grounded on `original_source/hat/lib/runner.py` (`BaseRunner._runner`,
//! `command_run_save`, `run_command`, `_check_and_write`). The Python
//! version is a singleton reading raw FIFO lines; here the store is
//! owned by one task and every mutation arrives over a `tokio::sync::mpsc`
//! mailbox (`RunnerRequest`), per DESIGN.md's "Global mutable store →
//! actor" note — no other task ever touches the store directly.

use std::process::Stdio;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::TimeZone;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::{HatPaths, TICK_INTERVAL_MS};
use crate::error::HatError;
use crate::ipc;
use crate::store::{Job, Store};

/// One message delivered to the runner's mailbox. Each mutating variant
/// carries a `reply` channel so the caller (daemon front) can forward a
/// synchronous-looking response back to the client, matching the
/// request/response shape of the original wire protocol.
pub enum RunnerRequest {
    AddJob {
        owner_uid: u32,
        command: String,
        shell: Option<String>,
        run_at_epoch: i64,
        exact: bool,
        reply: oneshot::Sender<Result<u32, HatError>>,
    },
    ModifyJob {
        owner_uid: u32,
        job_id: u32,
        command: Option<String>,
        shell: Option<Option<String>>,
        run_at_epoch: Option<i64>,
        exact: Option<bool>,
        reply: oneshot::Sender<Result<(), HatError>>,
    },
    RemoveJob {
        owner_uid: u32,
        job_id: u32,
        reply: oneshot::Sender<()>,
    },
    JobList {
        owner_uid: u32,
        reply: oneshot::Sender<Vec<Job>>,
    },
    JobCount {
        owner_uid: u32,
        reply: oneshot::Sender<usize>,
    },
    Stop,
}

fn now_epoch() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Runs until a [`RunnerRequest::Stop`] is received. Persists the store
/// whenever it changes during a tick, mirroring the original's
/// `_dump_db()` calls after every mutation and after every batch of
/// fired jobs.
pub async fn run(mut store: Store, mut mailbox: mpsc::Receiver<RunnerRequest>, paths: HatPaths) {
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(TICK_INTERVAL_MS));

    loop {
        interval.tick().await;
        let mut dirty = false;
        // Step 1: drain control messages. `remove` is only buffered here —
        // spec.md §4.3 step 3 applies pending removals *after* due jobs are
        // fired in step 2, so a job due and removed in the same tick still
        // fires (§5: "fires apply before removals").
        let mut pending_removals: Vec<(u32, u32)> = Vec::new();

        while let Ok(request) = mailbox.try_recv() {
            match request {
                RunnerRequest::Stop => {
                    info!("runner received stop request");
                    for (owner_uid, job_id) in pending_removals {
                        store.remove(owner_uid, job_id);
                        dirty = true;
                    }
                    if dirty {
                        persist(&store, &paths);
                    }
                    return;
                }
                RunnerRequest::AddJob { owner_uid, command, shell, run_at_epoch, exact, reply } => {
                    let result = store.add(owner_uid, command, shell, run_at_epoch, exact, now_epoch());
                    dirty |= result.is_ok();
                    let _ = reply.send(result);
                }
                RunnerRequest::ModifyJob { owner_uid, job_id, command, shell, run_at_epoch, exact, reply } => {
                    let result = store.modify(owner_uid, job_id, command, shell, run_at_epoch, exact, now_epoch());
                    dirty |= result.is_ok();
                    let _ = reply.send(result);
                }
                RunnerRequest::RemoveJob { owner_uid, job_id, reply } => {
                    pending_removals.push((owner_uid, job_id));
                    let _ = reply.send(());
                }
                RunnerRequest::JobList { owner_uid, reply } => {
                    let jobs = store.list(owner_uid).into_iter().cloned().collect();
                    let _ = reply.send(jobs);
                }
                RunnerRequest::JobCount { owner_uid, reply } => {
                    let _ = reply.send(store.count(owner_uid));
                }
            }
        }

        // Step 2: fire due jobs.
        let due = store.drain_due(now_epoch());
        if !due.is_empty() {
            dirty = true;
            for job in due {
                tokio::spawn(async move {
                    fire(job).await;
                });
            }
        }

        // Step 3: apply the removals buffered in step 1.
        if !pending_removals.is_empty() {
            dirty = true;
            for (owner_uid, job_id) in pending_removals {
                store.remove(owner_uid, job_id);
            }
        }

        if dirty {
            persist(&store, &paths);
        }
    }
}

fn persist(store: &Store, paths: &HatPaths) {
    if let Err(e) = store.save(&paths.snapshot_file(), &paths.lock_file_for(&paths.snapshot_file())) {
        warn!("failed to persist job store: {e}");
    }
}

/// Outcome of running one job's command.
enum Outcome {
    /// A defined exit code, with captured stdout/stderr.
    Finished { code: i32, stdout: Vec<u8>, stderr: Vec<u8> },
    /// The child exited without a defined status (killed by a signal,
    /// e.g. a TTY-refreshing/interactive program that doesn't play well
    /// headless). spec.md §4.3: logged as a diagnostic and discarded —
    /// no stdout/stderr line is written for the owning user.
    Undefined,
}

/// Spawns one due job's command, waits for it to finish, and writes its
/// stdout/stderr to the owning user's logs. Runs detached from the tick
/// loop (`tokio::spawn`), matching the original's fire-and-forget
/// `multiprocessing.Process`.
async fn fire(job: Job) {
    let run_at = job.run_at_epoch;
    match run_command(&job).await {
        Outcome::Finished { code, stdout, stderr } => {
            write_job_log(&job, run_at, code, &stdout, true);
            write_job_log(&job, run_at, code, &stderr, false);
        }
        Outcome::Undefined => {
            warn!(
                "job {} (uid {}): {}: {}",
                job.job_id, job.owner_uid, HatError::InteractiveCommandRefused, job.command
            );
        }
    }
}

async fn run_command(job: &Job) -> Outcome {
    let mut cmd = match &job.shell {
        Some(shell) => {
            let mut c = tokio::process::Command::new(shell);
            c.arg("-c").arg(&job.command);
            c
        }
        None => match shlex::split(&job.command) {
            Some(argv) if !argv.is_empty() => {
                let mut c = tokio::process::Command::new(&argv[0]);
                c.args(&argv[1..]);
                c
            }
            _ => {
                return Outcome::Finished {
                    code: 127,
                    stdout: Vec::new(),
                    stderr: format!("could not tokenize command: {}", job.command).into_bytes(),
                }
            }
        },
    };
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    match cmd.output().await {
        Ok(output) => match output.status.code() {
            Some(code) => Outcome::Finished { code, stdout: output.stdout, stderr: output.stderr },
            None => Outcome::Undefined,
        },
        Err(e) => Outcome::Finished {
            code: 127,
            stdout: Vec::new(),
            stderr: e.to_string().into_bytes(),
        },
    }
}

/// Renders `run_at` in host-local time, matching
/// `time.strftime(..., time.localtime(run_at))` in the original — spec.md
/// §1 makes local time of the host authoritative, not UTC.
fn format_run_at_local(run_at: i64) -> String {
    chrono::Local
        .timestamp_opt(run_at, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| run_at.to_string())
}

/// Mirrors `runner.py::_check_and_write`: stdout is always logged (even
/// empty), stderr only when non-empty.
fn write_job_log(job: &Job, run_at: i64, returncode: i32, content: &[u8], is_stdout: bool) {
    if content.is_empty() && !is_stdout {
        return;
    }
    let path = if is_stdout {
        crate::config::HatPaths::stdout_log_for_uid(job.owner_uid)
    } else {
        crate::config::HatPaths::stderr_log_for_uid(job.owner_uid)
    };
    let Some(path) = path else {
        warn!("no home directory for uid {}, dropping log line", job.owner_uid);
        return;
    };

    let run_at_fmt = format_run_at_local(run_at);
    let line = format!(
        "euid>{} : id>{} : time>{} : cmd>{} : ret>{} :: out>{}",
        job.owner_uid,
        job.job_id,
        run_at_fmt,
        job.command,
        returncode,
        String::from_utf8_lossy(content),
    );
    if let Err(e) = ipc::append_dated_line(&path, &line) {
        warn!("failed to write job log {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_run_at_local_uses_host_local_time_not_utc() {
        let run_at = now_epoch();
        let want = chrono::Local
            .timestamp_opt(run_at, 0)
            .single()
            .unwrap()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert_eq!(format_run_at_local(run_at), want);
    }

    #[tokio::test]
    async fn add_and_stop_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HatPaths::under(dir.path());
        let (tx, rx) = mpsc::channel(8);
        let handle = tokio::spawn(run(Store::new(), rx, paths.clone()));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RunnerRequest::AddJob {
            owner_uid: 1000,
            command: "true".into(),
            shell: None,
            run_at_epoch: now_epoch() + 3600,
            exact: false,
            reply: reply_tx,
        })
        .await
        .unwrap();
        let job_id = reply_rx.await.unwrap().unwrap();
        assert_eq!(job_id, 1);

        let (count_tx, count_rx) = oneshot::channel();
        tx.send(RunnerRequest::JobCount { owner_uid: 1000, reply: count_tx }).await.unwrap();
        assert_eq!(count_rx.await.unwrap(), 1);

        tx.send(RunnerRequest::Stop).await.unwrap();
        handle.await.unwrap();
        assert!(paths.snapshot_file().exists());
    }

    /// A job that is both due and queued for removal within the same tick
    /// must still be handed to [`Store::drain_due`] before the buffered
    /// removal is applied — spec.md §4.3 step ordering (adds/fires before
    /// removals) and §5's "fires apply before removals" guarantee. A
    /// `remove` that mutated the store immediately (rather than being
    /// buffered) would make this job vanish from `drain_due` before it
    /// ever got a chance to fire.
    #[test]
    fn due_job_survives_a_same_tick_remove_request_until_after_drain() {
        let mut store = Store::new();
        let now = now_epoch();
        let id = store.add(1000, "true".into(), None, now, false, now).unwrap();

        // Mirrors the runner's step 1: buffer the removal, don't apply it.
        let pending_removals = vec![(1000u32, id)];

        // Step 2: due jobs are drained (and thus fire) while the job is
        // still present, regardless of the pending removal.
        let due = store.drain_due(now);
        assert_eq!(due.len(), 1, "the due job must still be returned for firing");
        assert_eq!(due[0].job_id, id);

        // Step 3: the buffered removal is applied afterward; a no-op here
        // since drain_due already removed the job, matching remove's
        // documented idempotence.
        for (owner_uid, job_id) in pending_removals {
            store.remove(owner_uid, job_id);
        }
        assert_eq!(store.count(1000), 0);
    }

    #[tokio::test]
    async fn run_command_tokenizes_without_shell() {
        let job = Job {
            job_id: 1,
            owner_uid: 1000,
            command: "echo hello".into(),
            shell: None,
            run_at_epoch: 0,
            exact: false,
        };
        match run_command(&job).await {
            Outcome::Finished { code, stdout, .. } => {
                assert_eq!(code, 0);
                assert_eq!(String::from_utf8_lossy(&stdout).trim(), "hello");
            }
            Outcome::Undefined => panic!("expected a defined exit code"),
        }
    }

    #[tokio::test]
    async fn run_command_uses_named_shell() {
        let job = Job {
            job_id: 1,
            owner_uid: 1000,
            command: "echo $((1+1))".into(),
            shell: Some("sh".into()),
            run_at_epoch: 0,
            exact: false,
        };
        match run_command(&job).await {
            Outcome::Finished { code, stdout, .. } => {
                assert_eq!(code, 0);
                assert_eq!(String::from_utf8_lossy(&stdout).trim(), "2");
            }
            Outcome::Undefined => panic!("expected a defined exit code"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_reports_exit_code_127() {
        let job = Job {
            job_id: 1,
            owner_uid: 1000,
            command: "this-binary-does-not-exist-anywhere".into(),
            shell: None,
            run_at_epoch: 0,
            exact: false,
        };
        match run_command(&job).await {
            Outcome::Finished { code, stderr, .. } => {
                assert_eq!(code, 127);
                assert!(!stderr.is_empty());
            }
            Outcome::Undefined => panic!("expected a defined exit code (spawn failure path)"),
        }
    }

    #[tokio::test]
    async fn undefined_exit_status_is_discarded_not_logged_as_127() {
        // A process killed by a signal (SIGKILL) exits with no defined
        // status code on Unix — this must be distinguished from a normal
        // exit code 127, per spec.md §4.3's "interactive/TTY-refreshing
        // commands are not supported" discard path.
        let job = Job {
            job_id: 1,
            owner_uid: 1000,
            command: "kill -9 $$".into(),
            shell: Some("sh".into()),
            run_at_epoch: 0,
            exact: false,
        };
        match run_command(&job).await {
            Outcome::Undefined => {}
            Outcome::Finished { code, .. } => {
                panic!("expected Outcome::Undefined for a signal-killed child, got code {code}")
            }
        }
    }
}
