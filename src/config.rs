//! Filesystem layout and tunables.
//!
//! Every path the daemon, client, and log parser agree on lives here so
//! there is exactly one place to retarget the install root (e.g. for
//! tests, which override `HatPaths::under` with a temp directory).

use std::path::{Path, PathBuf};

/// Maximum number of jobs live in the store at once.
pub const MAX_JOBS: u32 = 40_000;

/// Insertion-time backward-time-travel margin, in seconds.
pub const BACKWARD_MARGIN_SECS: i64 = 2;

/// Runner tick interval.
pub const TICK_INTERVAL_MS: u64 = 100;

/// How long the client waits for a reply before giving up.
pub const CLIENT_REPLY_TIMEOUT_SECS: u64 = 1;

/// How long the supervisor waits after `start` before checking liveness.
pub const STARTUP_GRACE_SECS: u64 = 1;

/// Resolved filesystem layout for one `hatd` installation.
#[derive(Debug, Clone)]
pub struct HatPaths {
    root: PathBuf,
}

impl HatPaths {
    /// The standard system-wide layout rooted at `/var`.
    pub fn system() -> Self {
        HatPaths { root: PathBuf::from("/") }
    }

    /// An installation rooted anywhere else (used by tests, and by a
    /// `--root` override an operator could add later).
    pub fn under(root: impl Into<PathBuf>) -> Self {
        HatPaths { root: root.into() }
    }

    fn join(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    pub fn ipc_dir(&self) -> PathBuf {
        self.join("var/run/hatd/ipc")
    }

    pub fn daemon_in(&self) -> PathBuf {
        self.ipc_dir().join("daemon_in")
    }

    pub fn daemon_out(&self) -> PathBuf {
        self.ipc_dir().join("daemon_out")
    }

    /// Retained for filesystem-layout compatibility; not opened as a real
    /// FIFO by the daemon (see DESIGN.md, Open Question 5 — the daemon
    /// front and runner share an in-process mailbox instead).
    pub fn runner_in(&self) -> PathBuf {
        self.ipc_dir().join("runner_in")
    }

    /// See [`HatPaths::runner_in`].
    pub fn runner_out(&self) -> PathBuf {
        self.ipc_dir().join("runner_out")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.join("var/run/hatd/hatd.pid")
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.join("var/run/hatd/locks")
    }

    pub fn lock_file_for(&self, guarded_path: &Path) -> PathBuf {
        let key = guarded_path.to_string_lossy().replace('/', "_");
        self.lock_dir().join(format!("._{key}.lock"))
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.join("var/lib/hatd/hatdb")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.join("var/log/hatd/daemon.log")
    }

    /// `~/.hatd` for the invoking user (not relative to `root`: this is
    /// always the real home directory).
    pub fn user_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".hatd"))
    }

    pub fn user_stdout_log() -> Option<PathBuf> {
        Self::user_dir().map(|d| d.join("logs").join("stdout.log"))
    }

    pub fn user_stderr_log() -> Option<PathBuf> {
        Self::user_dir().map(|d| d.join("logs").join("stderr.log"))
    }

    /// `~/.hatd/logs/stdout.log` for an arbitrary `owner_uid`, not
    /// necessarily the current process's. The runner needs this to log a
    /// job to the home directory of the user who submitted it, not its
    /// own (it typically runs as root).
    pub fn stdout_log_for_uid(owner_uid: u32) -> Option<PathBuf> {
        home_dir_for_uid(owner_uid).map(|h| h.join(".hatd").join("logs").join("stdout.log"))
    }

    pub fn stderr_log_for_uid(owner_uid: u32) -> Option<PathBuf> {
        home_dir_for_uid(owner_uid).map(|h| h.join(".hatd").join("logs").join("stderr.log"))
    }
}

/// Resolves the home directory for a UID by scanning `/etc/passwd`,
/// generalizing `utils.py::username_from_euid` (which only resolves the
/// username) to resolve the home directory field directly.
pub fn home_dir_for_uid(uid: u32) -> Option<PathBuf> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    for line in passwd.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        // name:passwd:uid:gid:gecos:home:shell
        if fields.len() >= 6 && fields[2].parse::<u32>().ok() == Some(uid) {
            return Some(PathBuf::from(fields[5]));
        }
    }
    None
}

impl Default for HatPaths {
    fn default() -> Self {
        Self::system()
    }
}
