//! `hatd` — a per-host, multi-user one-shot job scheduler.
//!
//! This crate is the library half shared by the three binaries in
//! `src/bin/`: the daemon (`hatd`), the client (`hatc`), and the log
//! parser (`hat-parser`). Each module owns one concern named in
//! DESIGN.md's grounding ledger.

pub mod config;
pub mod daemon_front;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod runner;
pub mod store;
pub mod supervisor;
pub mod time_parser;
