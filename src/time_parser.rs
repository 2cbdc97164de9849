//! Human-time → epoch conversion.
//!
//! Grounded directly on `original_source/hat/lib/humantime_epoch_converter.py`:
//! same phrase grammar, same weekday aliases, and — deliberately — the same
//! "zero component falls back to the current wall-clock field" padding
//! quirk, preserved for compatibility (see DESIGN.md, Open Question 1).

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Weekday};

use crate::error::HatError;

/// The two canonical absolute-time formats the store itself accepts. This
/// is the narrower parser used once a job's `time_` field already carries
/// an absolute timestamp string, e.g. after the client has run
/// [`parse_human_time`] locally and re-rendered the result (see
/// `src/bin/hatc.rs`).
pub const ALLOWED_STRPTIMES: &[&str] = &["%Y-%m-%d_%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

/// Parses `input` against the human-time phrase grammar, returning an
/// absolute instant (epoch seconds) in host-local time.
pub fn parse_human_time(input: &str) -> Result<i64, HatError> {
    parse_human_time_at(input, Local::now().naive_local())
}

/// Same as [`parse_human_time`] but with an injectable "now", for
/// deterministic unit tests.
pub fn parse_human_time_at(input: &str, now: NaiveDateTime) -> Result<i64, HatError> {
    let normalized = normalize(input);
    check_format(&normalized, now)
}

/// Parses one of the two canonical absolute formats.
pub fn parse_strptime_epoch(input: &str) -> Result<i64, HatError> {
    for fmt in ALLOWED_STRPTIMES {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, fmt) {
            return Ok(to_epoch(dt));
        }
    }
    Err(HatError::AmbiguousInput(format!(
        "Ambiguous input time: {input}. Please see the help page."
    )))
}

fn to_epoch(dt: NaiveDateTime) -> i64 {
    Local
        .from_local_datetime(&dt)
        .single()
        .unwrap_or_else(|| Local.from_utc_datetime(&dt))
        .timestamp()
}

/// Lower-cases, trims, strips a trailing `:`, and spaces out `+`/`-` and
/// digit/letter boundaries, mirroring the original's regex-based
/// normalization so later matching can work token-by-token.
fn normalize(input: &str) -> String {
    let lowered = input.to_lowercase();
    let trimmed = lowered.trim().trim_end_matches(':');
    let spaced_signs = trimmed.replace('+', " + ").replace('-', " - ");

    // Insert a space between a run of digits and the letters that follow
    // immediately (e.g. "30min" -> "30 min"), matching the original's
    // `re.split(r'(\d+)([a-z]+)', ...)` behavior.
    let mut out = String::with_capacity(spaced_signs.len() + 8);
    let chars: Vec<char> = spaced_signs.chars().collect();
    for i in 0..chars.len() {
        out.push(chars[i]);
        if chars[i].is_ascii_digit() {
            if let Some(&next) = chars.get(i + 1) {
                if next.is_ascii_alphabetic() {
                    out.push(' ');
                }
            }
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn check_format(normalized: &str, now: NaiveDateTime) -> Result<i64, HatError> {
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();

    if normalized == "now" {
        return Ok(to_epoch(now));
    }
    if tokens.iter().any(|&t| t == "+" || t == "-") {
        return add_sub(normalized, &tokens, now);
    }
    if tokens.first() == Some(&"next") {
        return has_next(&tokens, now);
    }
    if tokens.contains(&"yesterday") {
        return yesterday_today_tomorrow(normalized, now, Day::Yesterday);
    }
    if tokens.contains(&"today") {
        return yesterday_today_tomorrow(normalized, now, Day::Today);
    }
    if tokens.contains(&"tomorrow") {
        return yesterday_today_tomorrow(normalized, now, Day::Tomorrow);
    }
    Err(HatError::AmbiguousInput(normalized.to_string()))
}

enum Day {
    Yesterday,
    Today,
    Tomorrow,
}

fn yesterday_today_tomorrow(normalized: &str, now: NaiveDateTime, day: Day) -> Result<i64, HatError> {
    let (hh, mm, ss) = extract_time_of_day(normalized);
    let offset = match day {
        Day::Yesterday => -1,
        Day::Today => 0,
        Day::Tomorrow => 1,
    };
    let date = now.date() + chrono::Duration::days(offset);
    Ok(build_epoch(now, date, hh, mm, ss))
}

fn has_next(tokens: &[&str], now: NaiveDateTime) -> Result<i64, HatError> {
    if tokens.len() < 2 {
        return Err(HatError::AmbiguousInput(tokens.join(" ")));
    }
    let day_word = tokens[1];
    if day_word == "day" {
        // "next day" is an alias for tomorrow.
        let rest = tokens[2..].join(" ");
        let normalized = format!("tomorrow {rest}").trim().to_string();
        return yesterday_today_tomorrow(&normalized, now, Day::Tomorrow);
    }

    let target = weekday_from_alias(day_word)
        .ok_or_else(|| HatError::AmbiguousInput(tokens.join(" ")))?;

    let today_wday = now.weekday().num_days_from_monday();
    let target_wday = target.num_days_from_monday();
    let diff = (target_wday as i64 - today_wday as i64).rem_euclid(7);
    let days_ahead = if diff == 0 { 7 } else { diff };

    let date = now.date() + chrono::Duration::days(days_ahead);
    let joined = tokens.join(" ");
    let (hh, mm, ss) = extract_time_of_day(&joined);
    Ok(build_epoch(now, date, hh, mm, ss))
}

fn weekday_from_alias(word: &str) -> Option<Weekday> {
    const TABLE: &[(&[&str], Weekday)] = &[
        (&["sat", "satur", "saturday"], Weekday::Sat),
        (&["sun", "sunday"], Weekday::Sun),
        (&["mon", "monday"], Weekday::Mon),
        (&["tue", "tues", "tuesday"], Weekday::Tue),
        (&["wed", "wednes", "wednesday"], Weekday::Wed),
        (&["thu", "thurs", "thursday"], Weekday::Thu),
        (&["fri", "friday"], Weekday::Fri),
    ];
    TABLE
        .iter()
        .find(|(aliases, _)| aliases.contains(&word))
        .map(|(_, wd)| *wd)
}

/// Strips a leading day phrase (and optional "at") from `normalized`,
/// returning the `(HH, MM, SS)` time-of-day tail, each defaulting to `0`
/// when absent — see `build_epoch` for the current-wall-clock fallback on
/// zero components.
fn extract_time_of_day(normalized: &str) -> (u32, u32, u32) {
    let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
    let start = tokens.iter().position(|t| t.chars().any(|c| c.is_ascii_digit()));
    let Some(start) = start else { return (0, 0, 0) };

    let tail = tokens[start..]
        .iter()
        .copied()
        .filter(|&t| t != "at")
        .collect::<Vec<_>>()
        .join(" ");

    let mut parts: Vec<u32> = tail
        .split(|c: char| c == ':' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().unwrap_or(0))
        .collect();
    parts.resize(3, 0);
    (parts[0], parts[1], parts[2])
}

/// Builds the absolute instant for `date` at `hh:mm:ss`, falling back to
/// the matching field of `now` for any component that is exactly zero —
/// the original's `tm_hour or today_.tm_hour`-style fallback, preserved
/// verbatim for compatibility (spec.md §9, Open Question 1).
fn build_epoch(now: NaiveDateTime, date: NaiveDate, hh: u32, mm: u32, ss: u32) -> i64 {
    let hour = if hh == 0 { now.hour() } else { hh };
    let min = if mm == 0 { now.minute() } else { mm };
    let sec = if ss == 0 { now.second() } else { ss };
    let time = NaiveTime::from_hms_opt(hour % 24, min % 60, sec % 60).unwrap_or(now.time());
    to_epoch(NaiveDateTime::new(date, time))
}

fn add_sub(normalized: &str, tokens: &[&str], now: NaiveDateTime) -> Result<i64, HatError> {
    let idx = tokens
        .iter()
        .position(|&t| t == "+" || t == "-")
        .expect("caller verified a +/- token exists");
    let op = tokens[idx];
    let before = tokens[..idx].join(" ");
    let after = &tokens[idx + 1..];

    let before_epoch = if before.is_empty() {
        return Err(HatError::AmbiguousInput(normalized.to_string()));
    } else {
        check_format(&before, now)?
    };

    let delta = add_sub_seconds(after)?;
    Ok(if op == "+" { before_epoch + delta } else { before_epoch - delta })
}

fn add_sub_seconds(after: &[&str]) -> Result<i64, HatError> {
    const HOURS: &[&str] = &["hours", "hour", "hrs", "hr", "h"];
    const MINUTES: &[&str] = &["minutes", "minute", "mins", "min", "m"];
    const SECONDS: &[&str] = &["seconds", "second", "secs", "sec", "s"];

    let mut hrs: i64 = 0;
    let mut mins: i64 = 0;
    let mut secs: i64 = 0;

    let mut i = 0;
    while i < after.len() {
        let val: i64 = after[i]
            .parse()
            .map_err(|_| HatError::AmbiguousInput(after.join(" ")))?;
        let unit = after.get(i + 1).copied();
        match unit {
            Some(u) if HOURS.contains(&u) => hrs = val,
            Some(u) if MINUTES.contains(&u) => mins = val,
            Some(u) if SECONDS.contains(&u) => secs = val,
            None => secs = val,
            Some(other) => {
                return Err(HatError::AmbiguousInput(format!(
                    "Ambiguous input: {other}"
                )))
            }
        }
        i += 2;
    }
    Ok(hrs * 3600 + mins * 60 + secs)
}
