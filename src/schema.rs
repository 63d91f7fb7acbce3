//! Database row types for jobs and their status log.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// A job to be enqueued via [`JobStore::store`](crate::JobStore::store).
///
/// The job identifier is assigned by the owning shard's sequence on insert;
/// everything else is supplied by the caller and immutable afterwards.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Caller-supplied opaque identifier, carried through unchanged.
    pub uuid: Uuid,
    /// Short tag used as a coarse filter (at most 64 chars).
    pub custom_val: String,
    /// Opaque JSON payload.
    pub event_payload: Value,
    /// Creation timestamp.
    pub created_at: NaiveDateTime,
    /// Expiry timestamp. Not interpreted by the store.
    pub expire_at: NaiveDateTime,
}

/// A job record read back from a shard.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Identifier assigned at insert time. Strictly increasing across
    /// successful [`store`](crate::JobStore::store) calls, even across
    /// shard boundaries.
    pub job_id: i64,
    /// Caller-supplied opaque identifier.
    pub uuid: Uuid,
    /// Short tag used as a coarse filter.
    pub custom_val: String,
    /// Opaque JSON payload.
    pub event_payload: Value,
    /// Creation timestamp.
    pub created_at: NaiveDateTime,
    /// Expiry timestamp.
    pub expire_at: NaiveDateTime,
    /// Latest status row, populated by processed-job reads. `None` for
    /// unprocessed jobs.
    #[sqlx(skip)]
    pub last_status: Option<JobStatus>,
}

/// One attempt or state transition for a job.
///
/// Status rows are append-only; the current status of a job is the row with
/// the highest `id` in its shard's status table.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// The job this row belongs to.
    pub job_id: i64,
    /// State recorded by this transition.
    pub job_state: JobState,
    /// Attempt counter, maintained by the caller.
    pub attempt: i16,
    /// When the attempt executed.
    pub exec_time: NaiveDateTime,
    /// Earliest time the job should be retried. Processed-job reads skip
    /// jobs whose latest `retry_time` is still in the future.
    pub retry_time: NaiveDateTime,
    /// Short error code (at most 32 chars).
    pub error_code: String,
    /// Opaque JSON error payload.
    pub error_response: Value,
}

/// Job lifecycle states, mirroring the `job_state_type` enum in PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_state_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Handed to a consumer, waiting for a processing slot.
    Waiting,
    /// Currently being processed.
    Executing,
    /// Finished successfully. Terminal.
    Succeeded,
    /// Failed and scheduled for a retry.
    WaitingRetry,
    /// Failed; eligible for [`get_to_retry`](crate::JobStore::get_to_retry).
    Failed,
    /// Given up on. Terminal.
    Aborted,
}

impl JobState {
    /// Terminal states are never revisited; compaction discards such jobs
    /// together with their status history.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Aborted)
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Executing => "executing",
            JobState::Succeeded => "succeeded",
            JobState::WaitingRetry => "waiting_retry",
            JobState::Failed => "failed",
            JobState::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The non-terminal states. A job whose latest status is one of these (or
/// which has no status at all) is live and survives compaction.
pub(crate) const LIVE_STATES: [JobState; 4] = [
    JobState::Failed,
    JobState::Waiting,
    JobState::WaitingRetry,
    JobState::Executing,
];
