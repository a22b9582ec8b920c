//! Unified `Database` trait: the state store, checkpoint store and
//! dead-letter store behind one async interface.
//!
//! Every method that moves a job validates the transition against
//! `JobState` and appends the matching `StateTransition` records in the
//! same transaction as the job update.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkpoint::{Checkpoint, StoredCheckpoint};
use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, ResolutionStatus};
use crate::error::{DatabaseError, ErrorKind, HandlerError, JobError};
use crate::jobs::{Job, JobFilter, JobId, JobState, StateTransition, TaskType};
use crate::queue::Partition;

/// Who is moving a job, checked inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership<'a> {
    /// Producers and operators.
    Any,
    /// The worker whose lease is on the job.
    Owner(&'a str),
    /// Recovery. Only allowed once the lease is absent or expired at `now`.
    Stale { now: DateTime<Utc> },
}

/// How recovery starts a job over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Restart {
    /// Fresh attempt, charged to the retry budget and eligible at once.
    Retry,
    /// Budget spent: dead-letter with this kind.
    DeadLetter(ErrorKind),
}

/// A non-terminal job whose last transition is older than the stale
/// threshold and which holds no live lease.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleJob {
    pub id: JobId,
    pub state: JobState,
    pub task_type: TaskType,
    pub retry_count: u32,
    pub eligible_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    /// Why the job record cannot be parsed, if it cannot.
    pub unreadable: Option<String>,
}

/// Backend-agnostic database trait covering jobs, checkpoints and dead letters.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    /// Cheap read against the job tables.
    async fn ping(&self) -> Result<(), DatabaseError>;

    /// Cheap read against the checkpoint table.
    async fn ping_checkpoints(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Persist a new job in `Pending` with its creation transition.
    async fn insert_job(&self, job: &Job) -> Result<(), JobError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, DatabaseError>;

    /// Newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, DatabaseError>;

    /// Full audit trail, oldest first.
    async fn list_transitions(&self, id: JobId) -> Result<Vec<StateTransition>, DatabaseError>;

    /// Walk the job to `Queued` without touching its retry count, and make
    /// it eligible immediately. Used to publish new jobs and by recovery.
    async fn requeue(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        metadata: serde_json::Value,
    ) -> Result<JobState, JobError>;

    /// `Executing -> Completed`, storing the handler output.
    async fn complete_job(
        &self,
        id: JobId,
        owner: &str,
        result: &serde_json::Value,
    ) -> Result<(), JobError>;

    /// Record a failed attempt and park the job in `Retrying` until
    /// `delay` has passed. Returns the new retry count.
    async fn schedule_retry(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        delay: Duration,
    ) -> Result<u32, JobError>;

    /// Park the job in `Retrying` until `delay` has passed without touching
    /// its retry count. For attempts refused before the handler ran.
    async fn defer(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        delay: Duration,
    ) -> Result<(), JobError>;

    /// Start a stale job over: retry it or dead-letter it, and discard its
    /// live checkpoints, all in one transaction. Nothing is discarded if
    /// the move is refused. Returns how many checkpoints were discarded.
    async fn restart(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        restart: Restart,
    ) -> Result<usize, JobError>;

    /// Cancel a non-terminal job. Returns `false` if it was already terminal.
    async fn cancel_job(&self, id: JobId, reason: &str) -> Result<bool, JobError>;

    // ── Queue ───────────────────────────────────────────────────────

    /// Atomically lease the next eligible job in `partition`: highest
    /// priority class first, then earliest eligible. Retries whose backoff
    /// has elapsed are promoted to `Queued` first.
    async fn claim_next(
        &self,
        partition: Partition,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Job>, JobError>;

    /// Extend a lease. Returns the job's current state so the caller can
    /// notice cancellation; fails with `LeaseLost` if the lease was revoked.
    async fn renew_lease(
        &self,
        id: JobId,
        owner: &str,
        lease_ttl: Duration,
    ) -> Result<JobState, JobError>;

    /// Jobs waiting in `Queued` for the partition.
    async fn queue_depth(&self, partition: Partition) -> Result<usize, DatabaseError>;

    async fn list_stale_jobs(
        &self,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StaleJob>, DatabaseError>;

    // ── Checkpoints ─────────────────────────────────────────────────

    /// Append a checkpoint and update progress. Requires `owner` to hold
    /// the lease on an executing job and the sequence to exceed every
    /// sequence the job has written.
    async fn save_checkpoint(
        &self,
        owner: &str,
        checkpoint: &Checkpoint,
        progress: u8,
    ) -> Result<(), JobError>;

    /// Highest-sequence checkpoint not discarded by recovery.
    async fn latest_checkpoint(&self, id: JobId) -> Result<Option<StoredCheckpoint>, DatabaseError>;

    async fn list_checkpoints(&self, id: JobId) -> Result<Vec<StoredCheckpoint>, DatabaseError>;

    /// 0 if the job has never checkpointed.
    async fn max_checkpoint_sequence(&self, id: JobId) -> Result<u32, DatabaseError>;

    // ── Dead letters ────────────────────────────────────────────────

    /// Walk the job to `FailedDead` and upsert its dead-letter entry in one
    /// transaction. `kind` is the terminal classification.
    async fn dead_letter(
        &self,
        id: JobId,
        ownership: Ownership<'_>,
        error: &HandlerError,
        kind: ErrorKind,
    ) -> Result<DeadLetterEntry, JobError>;

    async fn get_dead_letter(&self, id: JobId) -> Result<Option<DeadLetterEntry>, DatabaseError>;

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, DatabaseError>;

    /// Revive a pending entry's job to `Queued` with a zero retry count.
    async fn retry_dead_letter(&self, id: JobId) -> Result<JobState, JobError>;

    async fn dismiss_dead_letter(&self, id: JobId) -> Result<DeadLetterEntry, JobError>;

    async fn count_dead_letters(
        &self,
        status: Option<ResolutionStatus>,
    ) -> Result<usize, DatabaseError>;
}
