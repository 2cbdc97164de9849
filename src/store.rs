//! The job store: per-user job records, ID allocation, and durable
//! snapshotting.
//!
//! Grounded on `original_source/hat/lib/scheduler.py` (`Job`,
//! `enqueued_jobs`, `_get_job_id`, `_check_perm`). The nested
//! `defaultdict(dict)` becomes a plain `HashMap<u32, HashMap<u32, Job>>`;
//! per the "Global mutable store → actor" design note this whole type is
//! meant to be owned by a single task (see `src/runner.rs`), not shared
//! behind a mutex.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{BACKWARD_MARGIN_SECS, MAX_JOBS};
use crate::error::HatError;
use crate::ipc;

/// One scheduled job.
///
/// `shell` carries the shell binary name when the job was submitted with
/// one (e.g. `bash`, `dash`); `None` means the command is tokenized and
/// executed directly, without a shell. The original stores the `<shell>
/// -c "<command>"` wrapping inside the command string itself and has to
/// regex it back out on a shell-stripping modify; keeping `shell` as its
/// own field avoids that round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: u32,
    pub owner_uid: u32,
    pub command: String,
    pub shell: Option<String>,
    pub run_at_epoch: i64,
    pub exact: bool,
}

/// All enqueued jobs, keyed first by owning UID and then by job ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Store {
    users: HashMap<u32, HashMap<u32, Job>>,
}

impl Store {
    pub fn new() -> Self {
        Store::default()
    }

    /// Enqueues a new job for `owner_uid`, returning its allocated ID.
    ///
    /// Rejects `run_at_epoch` values more than
    /// [`BACKWARD_MARGIN_SECS`] seconds in the past, relative to `now`.
    pub fn add(
        &mut self,
        owner_uid: u32,
        command: String,
        shell: Option<String>,
        run_at_epoch: i64,
        exact: bool,
        now: i64,
    ) -> Result<u32, HatError> {
        if run_at_epoch < now - BACKWARD_MARGIN_SECS {
            return Err(HatError::BackwardTimeTravel(run_at_epoch.to_string()));
        }
        let job_id = self.allocate_id()?;
        self.users.entry(owner_uid).or_default().insert(
            job_id,
            Job {
                job_id,
                owner_uid,
                command,
                shell,
                run_at_epoch,
                exact,
            },
        );
        Ok(job_id)
    }

    /// Updates an existing job in place. Every `Option` left `None` keeps
    /// the job's current value for that field.
    pub fn modify(
        &mut self,
        owner_uid: u32,
        job_id: u32,
        command: Option<String>,
        shell: Option<Option<String>>,
        run_at_epoch: Option<i64>,
        exact: Option<bool>,
        now: i64,
    ) -> Result<(), HatError> {
        let job = self
            .users
            .get_mut(&owner_uid)
            .and_then(|jobs| jobs.get_mut(&job_id))
            .ok_or(HatError::NotFound { owner_uid, job_id })?;

        if let Some(new_epoch) = run_at_epoch {
            if new_epoch < now - BACKWARD_MARGIN_SECS {
                return Err(HatError::BackwardTimeTravel(new_epoch.to_string()));
            }
            job.run_at_epoch = new_epoch;
        }
        if let Some(command) = command {
            job.command = command;
        }
        if let Some(shell) = shell {
            job.shell = shell;
        }
        if let Some(exact) = exact {
            job.exact = exact;
        }
        Ok(())
    }

    /// Removes a job. Idempotent: removing an already-absent job is a
    /// no-op, matching the original's best-effort `del` (it only logs on
    /// `KeyError`, it never raises to the caller).
    pub fn remove(&mut self, owner_uid: u32, job_id: u32) {
        if let Some(jobs) = self.users.get_mut(&owner_uid) {
            jobs.remove(&job_id);
        }
    }

    pub fn list(&self, owner_uid: u32) -> Vec<&Job> {
        self.users
            .get(&owner_uid)
            .map(|jobs| jobs.values().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, owner_uid: u32) -> usize {
        self.users.get(&owner_uid).map(HashMap::len).unwrap_or(0)
    }

    /// Every job due at or before `now`, across all users, removed from
    /// the store and returned to the caller for execution.
    pub fn drain_due(&mut self, now: i64) -> Vec<Job> {
        let mut due = Vec::new();
        for jobs in self.users.values_mut() {
            let ids: Vec<u32> = jobs
                .iter()
                .filter(|(_, j)| j.run_at_epoch <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(job) = jobs.remove(&id) {
                    due.push(job);
                }
            }
        }
        due
    }

    /// Every job in the store, ignoring ownership — used for the
    /// snapshot and for an operator-level `joblist` dump (the original's
    /// `euid == -1` sentinel; see DESIGN.md, Open Question 6).
    pub fn dump_all(&self) -> Vec<&Job> {
        self.users.values().flat_map(HashMap::values).collect()
    }

    fn allocate_id(&self) -> Result<u32, HatError> {
        let current_ids: HashSet<u32> =
            self.users.values().flat_map(HashMap::keys).copied().collect();
        let current_max = current_ids.iter().max().copied().unwrap_or(0);
        let next_id = current_max + 1;
        if next_id <= MAX_JOBS && !current_ids.contains(&next_id) {
            return Ok(next_id);
        }
        // Linear scan fallback, preserved from the original's
        // `range(1, max_id)` — note this deliberately never considers
        // MAX_JOBS itself as a fallback slot, only as a `next_id` value.
        for id in 1..MAX_JOBS {
            if !current_ids.contains(&id) {
                return Ok(id);
            }
        }
        Err(HatError::SlotExhausted(MAX_JOBS as usize))
    }

    /// Serializes the whole store, lock-guarded, to `path`, via a
    /// write-then-rename so a crash mid-write can never leave a
    /// truncated snapshot behind.
    pub fn save(&self, path: &Path, lock_path: &Path) -> Result<(), HatError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| HatError::SpawnFailed(format!("snapshot encode failed: {e}")))?;
        ipc::write_atomic_locked(path, lock_path, &bytes)
            .map_err(|e| HatError::SpawnFailed(format!("snapshot write failed: {e}")))
    }

    /// Loads a snapshot written by [`Store::save`]. A missing file is
    /// treated as an empty store (first run), matching the original's
    /// `FileNotFoundError -> saved_data = None` branch.
    pub fn load(path: &Path, lock_path: &Path) -> Result<Store, HatError> {
        match ipc::read_locked(path, lock_path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| HatError::SpawnFailed(format!("snapshot decode failed: {e}"))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Store::new()),
            Err(e) => Err(HatError::SpawnFailed(format!("snapshot read failed: {e}"))),
        }
    }
}

/// Checks that `caller_uid` is either the daemon's own EUID or root,
/// mirroring `scheduler.py::_check_perm`.
pub fn check_caller_permission(daemon_euid: u32, caller_uid: u32) -> Result<(), HatError> {
    if caller_uid == daemon_euid || caller_uid == 0 {
        Ok(())
    } else {
        Err(HatError::PermissionDenied { uid: caller_uid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_allocates_ids_from_one() {
        let mut store = Store::new();
        let id = store.add(1000, "echo hi".into(), None, 100, false, 0).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn add_rejects_jobs_too_far_in_the_past() {
        let mut store = Store::new();
        let err = store
            .add(1000, "echo hi".into(), None, 50, false, 100)
            .unwrap_err();
        assert!(matches!(err, HatError::BackwardTimeTravel(_)));
    }

    #[test]
    fn add_accepts_jobs_within_the_backward_margin() {
        let mut store = Store::new();
        // now=100, run_at=98 is within the 2s margin.
        let id = store.add(1000, "echo hi".into(), None, 98, false, 100).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn ids_reuse_freed_slots_before_growing() {
        let mut store = Store::new();
        let a = store.add(1000, "a".into(), None, 0, false, 0).unwrap();
        let _b = store.add(1000, "b".into(), None, 0, false, 0).unwrap();
        store.remove(1000, a);
        let c = store.add(1000, "c".into(), None, 0, false, 0).unwrap();
        assert_eq!(c, a, "freed id 1 should be reused rather than allocating 3");
    }

    #[test]
    fn slot_exhausted_past_max_jobs() {
        let mut store = Store::new();
        for _ in 0..MAX_JOBS {
            store.add(1000, "x".into(), None, 0, false, 0).unwrap();
        }
        let err = store.add(1000, "overflow".into(), None, 0, false, 0).unwrap_err();
        assert!(matches!(err, HatError::SlotExhausted(n) if n == MAX_JOBS as usize));
    }

    #[test]
    fn modify_retains_fields_left_unset() {
        let mut store = Store::new();
        let id = store
            .add(1000, "echo one".into(), Some("bash".into()), 0, false, 0)
            .unwrap();
        store.modify(1000, id, None, None, Some(500), None, 0).unwrap();
        let job = store.list(1000).into_iter().find(|j| j.job_id == id).unwrap();
        assert_eq!(job.command, "echo one");
        assert_eq!(job.shell.as_deref(), Some("bash"));
        assert_eq!(job.run_at_epoch, 500);
    }

    #[test]
    fn modify_missing_job_errors() {
        let mut store = Store::new();
        let err = store.modify(1000, 99, None, None, None, None, 0).unwrap_err();
        assert!(matches!(err, HatError::NotFound { owner_uid: 1000, job_id: 99 }));
    }

    #[test]
    fn remove_is_idempotent() {
        let mut store = Store::new();
        let id = store.add(1000, "echo".into(), None, 0, false, 0).unwrap();
        store.remove(1000, id);
        store.remove(1000, id);
        assert_eq!(store.count(1000), 0);
    }

    #[test]
    fn drain_due_only_takes_jobs_at_or_before_now() {
        let mut store = Store::new();
        store.add(1000, "early".into(), None, 10, false, 0).unwrap();
        store.add(1000, "late".into(), None, 1000, false, 0).unwrap();
        let due = store.drain_due(500);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].command, "early");
        assert_eq!(store.count(1000), 1);
    }

    #[test]
    fn permission_allows_daemon_euid_and_root() {
        assert!(check_caller_permission(1000, 1000).is_ok());
        assert!(check_caller_permission(1000, 0).is_ok());
        assert!(check_caller_permission(1000, 2000).is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("hatdb");
        let lock = dir.path().join("hatdb.lock");

        let mut store = Store::new();
        store.add(1000, "echo hi".into(), None, 123, true, 0).unwrap();
        store.save(&snapshot, &lock).unwrap();

        let loaded = Store::load(&snapshot, &lock).unwrap();
        assert_eq!(loaded.count(1000), 1);
        assert_eq!(loaded.dump_all().len(), 1);
    }

    #[test]
    fn load_missing_snapshot_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = dir.path().join("does-not-exist");
        let lock = dir.path().join("does-not-exist.lock");
        let loaded = Store::load(&snapshot, &lock).unwrap();
        assert_eq!(loaded.dump_all().len(), 0);
    }
}
