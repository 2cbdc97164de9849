//! The one error enum shared by every module in this crate.
//!
//! Binaries convert `HatError` into either a process exit code or a
//! `{"error":{"msg": ...}}` JSON reply; library code never panics on these
//! conditions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HatError {
    #[error("Ambiguous input: {0}")]
    AmbiguousInput(String),

    #[error("No backward time travel support: {0}")]
    BackwardTimeTravel(String),

    #[error("Job slot exceeded: Maximum {0} jobs can be enqueued")]
    SlotExhausted(usize),

    #[error("UID {uid}: Permission denied")]
    PermissionDenied { uid: u32 },

    #[error("No such job with ID {job_id} for UID {owner_uid}")]
    NotFound { owner_uid: u32, job_id: u32 },

    #[error("Failed to spawn command: {0}")]
    SpawnFailed(String),

    #[error("Interactive or screen refreshing commands are not allowed")]
    InteractiveCommandRefused,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),
}

impl HatError {
    /// The JSON reply body for every structured error:
    /// `{"error":{"msg": "..."}}`.
    pub fn as_reply(&self) -> serde_json::Value {
        serde_json::json!({ "error": { "msg": self.to_string() } })
    }

    /// Maps to the client's process exit codes.
    pub fn exit_code(&self) -> i32 {
        match self {
            HatError::PermissionDenied { .. } => 1,
            _ => 126,
        }
    }
}
