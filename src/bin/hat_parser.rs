//! `hat-parser` — grep-filters a user's `hatd` job output logs.
//!
//! Out of scope per spec.md §1 ("the separate log-parsing utility... is
//! a thin transformation over the core's contracts and is specified only
//! at its interface"); supplemented from
//! `original_source/hat/hat-parser.py` (`split_format`,
//! `search_params_formatter`, the timestamp-gated multiline scan) since
//! SPEC_FULL.md §4.8 names it as a real collaborator. Log rotation is an
//! explicit Non-goal (spec.md §1), so this reads the live
//! `~/.hatd/logs/{stdout,stderr}.log` files directly rather than
//! replicating the original's `glob`/`.gz` rotation-file handling.

use std::io::{BufRead, BufReader};

use chrono::NaiveDateTime;
use clap::Parser;
use hatd::config::HatPaths;
use regex::Regex;

const DT_FMT: &str = "%Y-%m-%dT%H:%M:%S";
const LOG_LINE_FMT: &str = "%Y-%m-%d %H:%M:%S";

/// Log parser for hatc – filters a user's job output logs by command,
/// stream, and time window.
#[derive(Parser, Debug)]
#[command(name = "hat-parser")]
struct Cli {
    /// Part of the command used (regex supported).
    #[arg(short = 'c', long = "command")]
    command: Option<String>,

    /// Show error (stderr) output instead of stdout.
    #[arg(short = 'e', long = "error")]
    stderr: bool,

    /// Compare against scheduled time instead of run time.
    #[arg(short = 's', long = "scheduled")]
    scheduled: bool,

    /// Show logs from this time (inclusive), `YYYY-mm-ddTHH:MM:SS`.
    #[arg(short = 'f', long = "from")]
    from_time: Option<String>,

    /// Show logs up to this time (inclusive), `YYYY-mm-ddTHH:MM:SS`.
    #[arg(short = 't', long = "to")]
    to_time: Option<String>,
}

struct ParsedLine {
    run_time: NaiveDateTime,
    scheduled_time: NaiveDateTime,
}

/// Splits one log line into its timestamped fields, mirroring
/// `hat-parser.py::split_format`.
fn split_format(line: &str) -> Option<ParsedLine> {
    let parts: Vec<&str> = line.split(" :").collect();
    if parts.len() < 6 {
        return None;
    }
    let run_time = NaiveDateTime::parse_from_str(parts[0].trim(), LOG_LINE_FMT).ok()?;
    let scheduled_field = parts[3].split('>').nth(1)?.trim();
    let scheduled_time = NaiveDateTime::parse_from_str(scheduled_field, LOG_LINE_FMT).ok()?;
    Some(ParsedLine { run_time, scheduled_time })
}

fn main() {
    let cli = Cli::parse();

    let command_re = Regex::new(cli.command.as_deref().unwrap_or(".")).unwrap_or_else(|_| {
        eprintln!("invalid command regex, falling back to match-all");
        Regex::new(".").unwrap()
    });

    let default_start = NaiveDateTime::parse_from_str("2018-01-01T00:00:00", DT_FMT).unwrap();
    let start_dt = cli
        .from_time
        .as_deref()
        .map(|s| {
            NaiveDateTime::parse_from_str(s, DT_FMT).unwrap_or_else(|_| {
                eprintln!("Datetime must be in format `YYYY-mm-ddTHH:MM:SS`. See `hat-parser --help`.");
                std::process::exit(1);
            })
        })
        .unwrap_or(default_start);

    let default_end = chrono::Local::now().format("%Y-%m-%dT23:59:59").to_string();
    let end_dt = cli
        .to_time
        .as_deref()
        .unwrap_or(&default_end)
        .to_string();
    let end_dt = NaiveDateTime::parse_from_str(&end_dt, DT_FMT).unwrap_or_else(|_| {
        eprintln!("Datetime must be in format `YYYY-mm-ddTHH:MM:SS`. See `hat-parser --help`.");
        std::process::exit(1);
    });

    let Some(user_dir) = HatPaths::user_dir() else {
        eprintln!("could not resolve home directory");
        std::process::exit(1);
    };
    let log_name = if cli.stderr { "stderr.log" } else { "stdout.log" };
    let log_path = user_dir.join("logs").join(log_name);

    let Ok(file) = std::fs::File::open(&log_path) else {
        // No log yet is not an error worth a nonzero exit: nothing fired.
        return;
    };

    let mut dt_line_printed = false;
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        let line = line.trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        let Some(parsed) = split_format(&line) else {
            if dt_line_printed {
                println!("{line}");
            }
            continue;
        };
        if !command_re.is_match(&line) {
            dt_line_printed = false;
            continue;
        }
        let compare_dt = if cli.scheduled { parsed.scheduled_time } else { parsed.run_time };
        if start_dt <= compare_dt && compare_dt <= end_dt {
            println!("{line}");
            dt_line_printed = true;
        } else {
            dt_line_printed = false;
            if !cli.scheduled && compare_dt > end_dt {
                break;
            }
        }
    }
}
