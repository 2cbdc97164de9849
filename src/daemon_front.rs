//! Front-facing dispatcher between the inbound JSON-line channel and the
//! runner's mailbox.
//!
//! Grounded on `original_source/hat/daemon_front.py`
//! (`DaemonWrapper.parse_check_forward`/`run`): a one-key object selects
//! the operation, the value is forwarded, and anything that doesn't parse
//! cleanly is logged and dropped rather than raising.

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::HatError;
use crate::runner::RunnerRequest;
use crate::time_parser;

/// Decodes one inbound line and drives it through `runner_tx`, returning
/// the JSON value to write to the outbound channel, or `None` when the
/// request is silently dropped (malformed JSON, unknown key, or a
/// reply-less message such as `stop`/`noop`).
pub async fn dispatch(line: &str, runner_tx: &mpsc::Sender<RunnerRequest>) -> Option<Value> {
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            debug!("dropping malformed inbound line: {e}");
            return None;
        }
    };
    let obj = value.as_object()?;
    let (key, payload) = obj.iter().next()?;

    match key.as_str() {
        "add_job" => add_job(payload, runner_tx).await,
        "modify_job" => add_job(payload, runner_tx).await,
        "remove_job" => remove_job(payload, runner_tx).await,
        "joblist" => joblist(payload, runner_tx).await,
        "jobcount" => jobcount(payload, runner_tx).await,
        "stop" => {
            let _ = runner_tx.send(RunnerRequest::Stop).await;
            None
        }
        "noop" => None,
        other => {
            debug!("dropping unrecognized inbound key: {other}");
            None
        }
    }
}

fn str_field(payload: &Value, name: &str) -> Result<String, HatError> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| HatError::MalformedMessage(format!("missing field '{name}'")))
}

fn u32_field(payload: &Value, name: &str) -> Result<u32, HatError> {
    payload
        .get(name)
        .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| HatError::MalformedMessage(format!("missing field '{name}'")))
}

/// Reads `use_shell` the way the original's `Job.use_shell` does: absent
/// or `false` means no shell, any other string names the shell binary.
fn shell_field(payload: &Value) -> Option<String> {
    match payload.get("use_shell") {
        Some(Value::String(s)) if s != "_" => Some(s.clone()),
        _ => None,
    }
}

async fn add_job(payload: &Value, runner_tx: &mpsc::Sender<RunnerRequest>) -> Option<Value> {
    let result = add_job_inner(payload, runner_tx).await;
    match result {
        Ok(()) => Some(json!({ "msg": "Done" })),
        Err(e) => Some(e.as_reply()),
    }
}

async fn add_job_inner(payload: &Value, runner_tx: &mpsc::Sender<RunnerRequest>) -> Result<(), HatError> {
    let owner_uid = u32_field(payload, "euid")?;
    let time_ = str_field(payload, "time_")?;
    let job_id = payload.get("job_id").and_then(|v| v.as_u64()).map(|n| n as u32);

    if let Some(job_id) = job_id {
        // Modify: `_` means "keep existing value" for command/time_/shell.
        let command = payload.get("command").and_then(Value::as_str);
        let command = command.filter(|c| *c != "_").map(str::to_string);

        let run_at_epoch = if time_ == "_" {
            None
        } else {
            Some(time_parser::parse_strptime_epoch(&time_)?)
        };

        let shell = match payload.get("use_shell").and_then(Value::as_str) {
            Some("_") | None => None,
            Some(_) => Some(shell_field(payload)),
        };

        let (reply, rx) = oneshot::channel();
        runner_tx
            .send(RunnerRequest::ModifyJob {
                owner_uid,
                job_id,
                command,
                shell,
                run_at_epoch,
                exact: None,
                reply,
            })
            .await
            .map_err(|_| HatError::MalformedMessage("runner mailbox closed".into()))?;
        rx.await
            .map_err(|_| HatError::MalformedMessage("runner reply lost".into()))?
            .map_err(|e| relabel_backward_time_travel(e, &time_))
    } else {
        let command = str_field(payload, "command")?;
        let shell = shell_field(payload);
        let run_at_epoch = time_parser::parse_strptime_epoch(&time_)?;

        let (reply, rx) = oneshot::channel();
        runner_tx
            .send(RunnerRequest::AddJob {
                owner_uid,
                command,
                shell,
                run_at_epoch,
                exact: false,
                reply,
            })
            .await
            .map_err(|_| HatError::MalformedMessage("runner mailbox closed".into()))?;
        rx.await
            .map_err(|_| HatError::MalformedMessage("runner reply lost".into()))?
            .map(|_job_id| ())
            .map_err(|e| relabel_backward_time_travel(e, &time_))
    }
}

/// The store reports `BackwardTimeTravel` against the epoch it was given,
/// since it has no notion of the human-entered time string; the wire-level
/// error the client sees should instead echo the `time_` field verbatim,
/// matching `original_source/hat/lib/scheduler.py::get_run_at_epoch`'s
/// `'No backward time travel support: {}'.format(self.time_str)`.
fn relabel_backward_time_travel(err: HatError, time_str: &str) -> HatError {
    match err {
        HatError::BackwardTimeTravel(_) => HatError::BackwardTimeTravel(time_str.to_string()),
        other => other,
    }
}

/// `{"remove_job": [euid, id1, id2, ...]}`, matching
/// `original_source/hat/daemon.py::HatDaemon.remove_job`'s `(euid, *ids)`
/// tuple shape. Replies `{"msg":"Queued"}` once the removals have been
/// forwarded, not once they've actually been applied (spec.md §4.3).
async fn remove_job(payload: &Value, runner_tx: &mpsc::Sender<RunnerRequest>) -> Option<Value> {
    let pairs = payload.as_array()?;
    if pairs.is_empty() {
        return Some(HatError::MalformedMessage("remove_job requires [euid, id...]".into()).as_reply());
    }
    let owner_uid = pairs[0].as_u64()? as u32;
    for id_value in &pairs[1..] {
        let Some(job_id) = id_value.as_u64() else { continue };
        let (reply, rx) = oneshot::channel();
        if runner_tx
            .send(RunnerRequest::RemoveJob { owner_uid, job_id: job_id as u32, reply })
            .await
            .is_err()
        {
            break;
        }
        let _ = rx.await;
    }
    Some(json!({ "msg": "Queued" }))
}

async fn joblist(payload: &Value, runner_tx: &mpsc::Sender<RunnerRequest>) -> Option<Value> {
    let owner_uid = payload.as_u64()? as u32;
    let (reply, rx) = oneshot::channel();
    runner_tx.send(RunnerRequest::JobList { owner_uid, reply }).await.ok()?;
    let mut jobs = rx.await.ok()?;
    jobs.sort_by_key(|j| (j.run_at_epoch, j.job_id));
    let pairs: Vec<Value> = jobs.iter().map(|j| json!([j.job_id, j])).collect();
    Some(Value::Array(pairs))
}

async fn jobcount(payload: &Value, runner_tx: &mpsc::Sender<RunnerRequest>) -> Option<Value> {
    let owner_uid = payload.as_u64()? as u32;
    let (reply, rx) = oneshot::channel();
    runner_tx.send(RunnerRequest::JobCount { owner_uid, reply }).await.ok()?;
    let count = rx.await.ok()?;
    Some(json!(count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn spawn_runner() -> mpsc::Sender<RunnerRequest> {
        let (tx, mut rx) = mpsc::channel::<RunnerRequest>(16);
        tokio::spawn(async move {
            let mut store = Store::new();
            while let Some(req) = rx.recv().await {
                match req {
                    RunnerRequest::AddJob { owner_uid, command, shell, run_at_epoch, exact, reply } => {
                        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
                        let _ = reply.send(store.add(owner_uid, command, shell, run_at_epoch, exact, now));
                    }
                    RunnerRequest::ModifyJob { owner_uid, job_id, command, shell, run_at_epoch, exact, reply } => {
                        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
                        let _ = reply.send(store.modify(owner_uid, job_id, command, shell, run_at_epoch, exact, now));
                    }
                    RunnerRequest::RemoveJob { owner_uid, job_id, reply } => {
                        store.remove(owner_uid, job_id);
                        let _ = reply.send(());
                    }
                    RunnerRequest::JobList { owner_uid, reply } => {
                        let _ = reply.send(store.list(owner_uid).into_iter().cloned().collect());
                    }
                    RunnerRequest::JobCount { owner_uid, reply } => {
                        let _ = reply.send(store.count(owner_uid));
                    }
                    RunnerRequest::Stop => break,
                }
            }
        });
        tx
    }

    #[tokio::test]
    async fn add_job_replies_done() {
        let tx = spawn_runner();
        let line = r#"{"add_job":{"euid":1000,"command":"true","time_":"2099-01-01_00:00:00"}}"#;
        let reply = dispatch(line, &tx).await.unwrap();
        assert_eq!(reply, json!({"msg": "Done"}));
    }

    #[tokio::test]
    async fn add_job_with_bad_time_replies_error() {
        let tx = spawn_runner();
        let line = r#"{"add_job":{"euid":1000,"command":"true","time_":"not-a-time"}}"#;
        let reply = dispatch(line, &tx).await.unwrap();
        assert!(reply.get("error").is_some());
    }

    #[tokio::test]
    async fn add_job_in_the_past_echoes_the_original_time_string() {
        let tx = spawn_runner();
        let line = r#"{"add_job":{"euid":1000,"command":"true","time_":"2000-01-01_00:00:00"}}"#;
        let reply = dispatch(line, &tx).await.unwrap();
        assert_eq!(
            reply,
            json!({"error": {"msg": "No backward time travel support: 2000-01-01_00:00:00"}})
        );
    }

    #[tokio::test]
    async fn malformed_json_is_dropped() {
        let tx = spawn_runner();
        assert!(dispatch("not json at all", &tx).await.is_none());
    }

    #[tokio::test]
    async fn unknown_key_is_dropped() {
        let tx = spawn_runner();
        assert!(dispatch(r#"{"frobnicate": 1}"#, &tx).await.is_none());
    }

    #[tokio::test]
    async fn joblist_is_sorted_by_run_at_then_job_id() {
        let tx = spawn_runner();
        dispatch(r#"{"add_job":{"euid":1000,"command":"b","time_":"2099-01-01_00:00:02"}}"#, &tx).await;
        dispatch(r#"{"add_job":{"euid":1000,"command":"a","time_":"2099-01-01_00:00:01"}}"#, &tx).await;
        let reply = dispatch(r#"{"joblist": 1000}"#, &tx).await.unwrap();
        let arr = reply.as_array().unwrap();
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0][1]["command"], "a");
        assert_eq!(arr[1][1]["command"], "b");
    }

    #[tokio::test]
    async fn remove_job_replies_queued() {
        let tx = spawn_runner();
        dispatch(r#"{"add_job":{"euid":1000,"command":"a","time_":"2099-01-01_00:00:01"}}"#, &tx).await;
        let reply = dispatch(r#"{"remove_job": [1000, 1]}"#, &tx).await.unwrap();
        assert_eq!(reply, json!({"msg": "Queued"}));
        let count = dispatch(r#"{"jobcount": 1000}"#, &tx).await.unwrap();
        assert_eq!(count, json!(0));
    }
}
