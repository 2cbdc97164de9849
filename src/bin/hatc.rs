//! `hatc` — the `hatd` client.
//!
//! Grounded on `original_source/hat/client.py`: `parse_arguments`,
//! `argument_serializer`, `SendReceiveData`, `check_daemon_process`, and
//! `create_user_files`. Argument parsing moves from hand-rolled
//! `argparse` to `clap`'s derive API (DESIGN.md: the teacher carried
//! `clap` as a dependency but never exercised it, since its own CLI was
//! a stdio MCP loop).

use std::path::PathBuf;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use chrono::TimeZone;
use clap::Parser;
use hatd::config::{HatPaths, CLIENT_REPLY_TIMEOUT_SECS};
use hatd::time_parser;
use hatd::{ipc, logging, supervisor};
use serde_json::{json, Value};

/// hat client — queue, inspect, and cancel one-shot jobs for the caller.
#[derive(Parser, Debug)]
#[command(name = "hatc", about = "hat client")]
struct Cli {
    /// Show the list of queued jobs for the current user (default).
    #[arg(short = 'l', long = "list")]
    list: bool,

    /// Show the number of queued jobs for the current user.
    #[arg(short = 'c', long = "count")]
    count: bool,

    /// Add a new job: <command> <datetime_spec> [<shell>].
    #[arg(short = 'a', long = "add", num_args = 2..=3, value_names = ["CMD", "TIME", "SHELL"])]
    add: Option<Vec<String>>,

    /// Modify a queued job: <job_id> [<command>|_] [<datetime_spec>|_] [<shell>|_].
    #[arg(short = 'm', long = "modify", num_args = 1..=4, value_names = ["ID", "CMD", "TIME", "SHELL"])]
    modify: Option<Vec<String>>,

    /// Remove queued job(s) by job ID.
    #[arg(short = 'r', long = "remove", num_args = 1.., value_name = "JOB_ID")]
    remove: Option<Vec<String>>,

    /// Positional escape hatch for the single-word `stop_daemon` command,
    /// checked before any other flag per `client.py::main`'s early
    /// `sys.argv[1] == 'stop_daemon'` branch.
    trailing: Option<String>,
}

fn print_msg(msg: &str) {
    println!("\n{msg}\n");
}

fn main() {
    logging::init();
    let paths = HatPaths::system();
    let euid = ipc::effective_uid();

    let raw: Vec<String> = std::env::args().collect();
    if raw.len() == 2 && raw[1] == "stop_daemon" {
        if euid != 0 {
            print_msg("Unknown operation");
            std::process::exit(1);
        }
        match supervisor::stop(&paths) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                print_msg(&e.to_string());
                std::process::exit(127);
            }
        }
    }

    if !supervisor::status(&paths) {
        print_msg("Daemon (hatd) is not running");
        std::process::exit(127);
    }

    let cli = Cli::parse();
    let request = match build_request(&cli, euid) {
        Ok(r) => r,
        Err(msg) => {
            print_msg(&msg);
            std::process::exit(126);
        }
    };

    create_user_files();
    let reply = send_and_await(&paths, request);
    if let Some(reply) = reply {
        println!("{}", serde_json::to_string_pretty(&reply).unwrap_or_default());
    }
}

fn build_request(cli: &Cli, euid: u32) -> Result<Value, String> {
    if let Some(add) = &cli.add {
        return add_job_request(add, euid, None);
    }
    if let Some(modify) = &cli.modify {
        let job_id: u32 = modify[0].parse().map_err(|_| "Ambiguous input".to_string())?;
        let mut fields = modify[1..].to_vec();
        while fields.len() < 3 {
            fields.push("_".to_string());
        }
        return add_job_request(&fields, euid, Some(job_id));
    }
    if let Some(ids) = &cli.remove {
        let mut pairs = vec![json!(euid)];
        for id in ids {
            let id: u32 = id.parse().map_err(|_| "Ambiguous input".to_string())?;
            pairs.push(json!(id));
        }
        return Ok(json!({ "remove_job": pairs }));
    }
    if cli.count {
        return Ok(json!({ "jobcount": euid }));
    }
    // `-l`/`--list` and "no arguments given" share the same default reply.
    Ok(json!({ "joblist": euid }))
}

/// Builds an `add_job` request. `fields` is `[command, time, shell?]`
/// (add) or `[command|_, time|_, shell|_]` (modify, `job_id` present).
/// The time phrase is converted to an absolute epoch *locally*, then
/// re-rendered as `%Y-%m-%d_%H:%M:%S`, exactly as
/// `client.py::SendReceiveData.add_job_fmt` does, so the daemon only
/// ever needs the narrower strptime-style parser.
fn add_job_request(fields: &[String], euid: u32, job_id: Option<u32>) -> Result<Value, String> {
    let command = fields[0].clone();
    let time_field = &fields[1];
    let shell = fields.get(2).cloned();

    let time_ = if time_field == "_" {
        "_".to_string()
    } else {
        let epoch = time_parser::parse_human_time(time_field).map_err(|e| e.to_string())?;
        chrono::Local
            .timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(|| "Ambiguous input".to_string())?
            .format("%Y-%m-%d_%H:%M:%S")
            .to_string()
    };

    let use_shell = match &shell {
        None => Value::Bool(false),
        Some(s) if s == "_" => Value::String("_".to_string()),
        Some(s) => Value::String(s.clone()),
    };

    let mut body = json!({
        "euid": euid,
        "command": command,
        "time_": time_,
        "use_shell": use_shell,
    });
    if let Some(job_id) = job_id {
        body["job_id"] = json!(job_id);
    }
    Ok(json!({ "add_job": body }))
}

/// Writes one request line to the daemon's inbound channel and waits up
/// to [`CLIENT_REPLY_TIMEOUT_SECS`] for one reply line, matching
/// `client.py::main`'s fixed 1s wait (spec.md §9, Open Question 4: no
/// retry is added).
fn send_and_await(paths: &HatPaths, request: Value) -> Option<Value> {
    if let Err(e) = ipc::write_one_line(&paths.daemon_in(), &request.to_string()) {
        eprintln!("failed to reach daemon: {e}");
        return None;
    }

    let out_path = paths.daemon_out();
    let (tx, rx) = std_mpsc::channel();
    std::thread::spawn(move || {
        let line = ipc::read_one_line(&out_path);
        let _ = tx.send(line);
    });

    match rx.recv_timeout(Duration::from_secs(CLIENT_REPLY_TIMEOUT_SECS)) {
        Ok(Ok(Some(line))) => serde_json::from_str(&line).ok(),
        _ => None,
    }
}

/// `~/.hatd/logs/{stdout,stderr}.log`, directory mode 0700, per
/// `client.py::create_user_files`.
fn create_user_files() {
    let Some(dir) = HatPaths::user_dir() else { return };
    let logs_dir = dir.join("logs");
    if std::fs::create_dir_all(&logs_dir).is_ok() {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&logs_dir, std::fs::Permissions::from_mode(0o700));
        }
        for name in ["stdout.log", "stderr.log"] {
            touch(&logs_dir.join(name));
        }
    }
}

fn touch(path: &PathBuf) {
    if !path.exists() {
        let _ = std::fs::write(path, b"");
    }
}
