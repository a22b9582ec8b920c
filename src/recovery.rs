//! Recovery scanner: reclaims jobs whose worker is gone.
//!
//! A job is stale when it is non-terminal, holds no live lease and its last
//! transition is older than `stale_after`. Every move made here is guarded
//! by `Ownership::Stale`, so a lease renewed between the scan and the
//! write wins and the job is left alone.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::deps::Dependencies;
use crate::error::{ErrorKind, HandlerError, JobError};
use crate::jobs::JobState;
use crate::store::{Ownership, Restart, StaleJob};

/// What recovery did with one stale job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Re-queued to continue from a valid checkpoint. No retry consumed.
    Resumed,
    /// Started over as a fresh retry.
    Retried,
    /// Published a job that never reached the queue or whose backoff ended.
    Requeued,
    /// Already claimable, or still waiting on its backoff.
    Untouched,
    DeadLettered,
    /// A live owner or another writer got there first.
    Skipped,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Resumed => "resumed",
            Self::Retried => "retried",
            Self::Requeued => "requeued",
            Self::Untouched => "untouched",
            Self::DeadLettered => "dead_lettered",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RecoveryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub resumed: usize,
    pub retried: usize,
    pub requeued: usize,
    pub untouched: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
}

impl RecoveryReport {
    fn record(&mut self, outcome: RecoveryOutcome) {
        self.scanned += 1;
        let counter = match outcome {
            RecoveryOutcome::Resumed => &mut self.resumed,
            RecoveryOutcome::Retried => &mut self.retried,
            RecoveryOutcome::Requeued => &mut self.requeued,
            RecoveryOutcome::Untouched => &mut self.untouched,
            RecoveryOutcome::DeadLettered => &mut self.dead_lettered,
            RecoveryOutcome::Skipped => &mut self.skipped,
        };
        *counter += 1;
    }

    /// Jobs made claimable by this pass.
    pub fn released(&self) -> usize {
        self.resumed + self.retried + self.requeued
    }
}

pub struct RecoveryScanner {
    deps: Dependencies,
    /// One pass at a time.
    pass: Mutex<()>,
    completed: AtomicBool,
}

impl RecoveryScanner {
    pub fn new(deps: Dependencies) -> Arc<Self> {
        Arc::new(Self {
            deps,
            pass: Mutex::new(()),
            completed: AtomicBool::new(false),
        })
    }

    /// Whether at least one full pass has finished. Gates readiness.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Run one pass over every stale job.
    pub async fn scan(&self) -> Result<RecoveryReport, JobError> {
        let _pass = self.pass.lock().await;
        let now = Utc::now();
        let stale_before = chrono::Duration::from_std(self.deps.config.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self.deps.store.list_stale_jobs(stale_before, now).await?;
        let mut report = RecoveryReport::default();

        for job in &stale {
            let outcome = match self.recover(job, now).await {
                Ok(outcome) => outcome,
                Err(
                    e @ (JobError::LeaseHeld { .. }
                    | JobError::InvalidTransition { .. }
                    | JobError::NotFound { .. }),
                ) => {
                    warn!(job_id = %job.id, error = %e, "Stale job changed under recovery, skipping");
                    RecoveryOutcome::Skipped
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Recovery pass aborted");
                    return Err(e);
                }
            };
            if outcome != RecoveryOutcome::Untouched {
                info!(job_id = %job.id, from = %job.state, %outcome, "Recovered stale job");
            }
            self.deps.metrics.record_recovery(outcome.as_str());
            report.record(outcome);
        }

        if report.released() > 0 {
            self.deps.queue.wake();
        }
        if !self.completed.swap(true, Ordering::SeqCst) {
            info!(?report, "Startup recovery complete");
        } else if report.scanned > 0 {
            info!(?report, "Recovery pass complete");
        }
        Ok(report)
    }

    async fn recover(&self, job: &StaleJob, now: DateTime<Utc>) -> Result<RecoveryOutcome, JobError> {
        let store = &self.deps.store;
        let stale = Ownership::Stale { now };

        if let Some(reason) = &job.unreadable {
            let error = HandlerError::invalid_input(format!("unreadable job record: {reason}"));
            store
                .dead_letter(job.id, stale, &error, ErrorKind::InvalidInput)
                .await?;
            self.deps
                .metrics
                .record_dead_lettered(job.task_type, ErrorKind::InvalidInput);
            return Ok(RecoveryOutcome::DeadLettered);
        }

        match job.state {
            JobState::Queued => Ok(RecoveryOutcome::Untouched),
            JobState::Pending => {
                store
                    .requeue(job.id, stale, json!({"recovery": "publish"}))
                    .await?;
                Ok(RecoveryOutcome::Requeued)
            }
            JobState::Retrying if job.eligible_at > now => Ok(RecoveryOutcome::Untouched),
            JobState::Retrying => {
                store
                    .requeue(job.id, stale, json!({"recovery": "backoff_elapsed"}))
                    .await?;
                Ok(RecoveryOutcome::Requeued)
            }
            JobState::Executing | JobState::Failed => self.reclaim(job, now).await,
            JobState::Completed | JobState::FailedDead | JobState::Cancelled => {
                Ok(RecoveryOutcome::Untouched)
            }
        }
    }

    /// Resume from the last checkpoint, or start over.
    async fn reclaim(&self, job: &StaleJob, now: DateTime<Utc>) -> Result<RecoveryOutcome, JobError> {
        let store = &self.deps.store;
        let stale = Ownership::Stale { now };

        match store.latest_checkpoint(job.id).await? {
            Some(stored) => match stored.validate() {
                Ok(checkpoint) => {
                    store
                        .requeue(
                            job.id,
                            stale,
                            json!({
                                "recovery": "resume",
                                "checkpoint_sequence": checkpoint.sequence,
                                "stage": checkpoint.stage_name,
                            }),
                        )
                        .await?;
                    Ok(RecoveryOutcome::Resumed)
                }
                Err(e) => {
                    warn!(
                        job_id = %job.id,
                        sequence = stored.sequence,
                        error = %e,
                        "Corrupt checkpoint, starting over"
                    );
                    let error = HandlerError::new(
                        ErrorKind::CheckpointCorrupt,
                        format!("checkpoint {} unusable: {e}", stored.sequence),
                    );
                    self.start_over(job, now, error, ErrorKind::CheckpointCorrupt)
                        .await
                }
            },
            None => {
                let error = HandlerError::resource_unavailable(
                    "worker stopped before the job finished",
                );
                self.start_over(job, now, error, ErrorKind::RetryBudgetExhausted)
                    .await
            }
        }
    }

    /// Fresh retry while budget remains, otherwise dead-letter as `exhausted`.
    /// Live checkpoints go in the same store transaction.
    async fn start_over(
        &self,
        job: &StaleJob,
        now: DateTime<Utc>,
        error: HandlerError,
        exhausted: ErrorKind,
    ) -> Result<RecoveryOutcome, JobError> {
        let stale = Ownership::Stale { now };
        let restart = if job.retry_count < self.deps.retry.max_retries() {
            Restart::Retry
        } else {
            Restart::DeadLetter(exhausted)
        };

        let discarded = self
            .deps
            .store
            .restart(job.id, stale, &error, restart)
            .await?;
        if discarded > 0 {
            info!(job_id = %job.id, discarded, "Checkpoints discarded");
        }

        match restart {
            Restart::Retry => {
                self.deps.metrics.record_retry(job.task_type);
                Ok(RecoveryOutcome::Retried)
            }
            Restart::DeadLetter(kind) => {
                self.deps.metrics.record_dead_lettered(job.task_type, kind);
                Ok(RecoveryOutcome::DeadLettered)
            }
        }
    }
}

/// Re-run recovery every `interval` until `shutdown` fires. Reclaims jobs
/// whose worker died after startup.
pub fn spawn_reaper(
    scanner: Arc<RecoveryScanner>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = scanner.scan().await {
                        error!(error = %e, "Periodic recovery failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CHECKPOINT_SCHEMA_VERSION, Checkpoint};
    use crate::config::JobsConfig;
    use crate::dead_letter::DeadLetterFilter;
    use crate::handler::HandlerRegistry;
    use crate::jobs::{Job, JobId, Priority, TaskType, is_valid_history};
    use crate::queue::Partition;

    const DEAD_WORKER: &str = "pool-dead:0";

    async fn deps() -> Dependencies {
        let config = JobsConfig {
            lease_ttl: Duration::ZERO,
            stale_after: Duration::from_millis(1),
            ..JobsConfig::default()
        };
        Dependencies::in_memory(config, HandlerRegistry::new())
            .await
            .unwrap()
    }

    /// A job claimed by a worker that died: lease already expired.
    async fn orphaned(deps: &Dependencies) -> JobId {
        let job = Job::new(TaskType::VideoRender, json!({"clip": 1}), Priority::Standard);
        deps.queue.enqueue(&job).await.unwrap();
        deps.store
            .claim_next(Partition::Media, DEAD_WORKER, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        job.id
    }

    fn checkpoint(id: JobId, sequence: u32, stage: &str, version: u32) -> Checkpoint {
        Checkpoint {
            job_id: id,
            stage_name: stage.to_string(),
            sequence,
            payload: json!({"done": stage}),
            saved_at: Utc::now(),
            schema_version: version,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[tokio::test]
    async fn checkpointed_job_resumes_without_spending_budget() {
        let deps = deps().await;
        let id = orphaned(&deps).await;
        for (seq, stage) in [(1, "script"), (2, "voiceover")] {
            deps.store
                .save_checkpoint(DEAD_WORKER, &checkpoint(id, seq, stage, CHECKPOINT_SCHEMA_VERSION), 50)
                .await
                .unwrap();
        }
        settle().await;

        let scanner = RecoveryScanner::new(deps.clone());
        assert!(!scanner.is_complete());
        let report = scanner.scan().await.unwrap();
        assert_eq!(report.resumed, 1);
        assert!(scanner.is_complete());

        let job = deps.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.retry_count, 0);
        assert!(job.lease_owner.is_none());

        let history = deps.store.list_transitions(id).await.unwrap();
        assert!(is_valid_history(&history));
        assert_eq!(history.last().unwrap().metadata["checkpoint_sequence"], 2);
        assert_eq!(
            deps.store.latest_checkpoint(id).await.unwrap().unwrap().stage_name,
            "voiceover"
        );
    }

    #[tokio::test]
    async fn job_without_checkpoint_is_retried() {
        let deps = deps().await;
        let id = orphaned(&deps).await;
        settle().await;

        let report = RecoveryScanner::new(deps.clone()).scan().await.unwrap();
        assert_eq!(report.retried, 1);

        let job = deps.store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Retrying);
        assert_eq!(job.retry_count, 1);

        // Zero backoff: claimable straight away.
        let again = deps.queue.dequeue("pool-new:0", Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.unwrap().id, id);
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_discarded_before_retry() {
        let deps = deps().await;
        let id = orphaned(&deps).await;
        deps.store
            .save_checkpoint(DEAD_WORKER, &checkpoint(id, 1, "script", CHECKPOINT_SCHEMA_VERSION + 1), 25)
            .await
            .unwrap();
        settle().await;

        let report = RecoveryScanner::new(deps.clone()).scan().await.unwrap();
        assert_eq!(report.retried, 1);
        assert!(deps.store.latest_checkpoint(id).await.unwrap().is_none());
        assert_eq!(
            deps.store.get_job(id).await.unwrap().unwrap().last_error_kind,
            Some(ErrorKind::CheckpointCorrupt)
        );
    }

    #[tokio::test]
    async fn exhausted_budget_goes_to_dead_letter() {
        let deps = deps().await;
        let id = orphaned(&deps).await;
        for _ in 0..deps.retry.max_retries() {
            deps.store
                .schedule_retry(
                    id,
                    Ownership::Owner(DEAD_WORKER),
                    &HandlerError::network_timeout("t"),
                    Duration::ZERO,
                )
                .await
                .unwrap();
            deps.store
                .claim_next(Partition::Media, DEAD_WORKER, Duration::ZERO)
                .await
                .unwrap()
                .unwrap();
        }
        settle().await;

        let report = RecoveryScanner::new(deps.clone()).scan().await.unwrap();
        assert_eq!(report.dead_lettered, 1);

        let entries = deps
            .store
            .list_dead_letters(&DeadLetterFilter::default())
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error_kind, ErrorKind::RetryBudgetExhausted);
        assert_eq!(entries[0].retry_count_at_failure, 5);
    }

    #[tokio::test]
    async fn live_lease_and_fresh_jobs_are_left_alone() {
        let deps = deps().await;
        let job = Job::new(TaskType::VideoRender, json!({}), Priority::Standard);
        deps.queue.enqueue(&job).await.unwrap();
        deps.store
            .claim_next(Partition::Media, "pool-live:0", Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let queued = Job::new(TaskType::Maintenance, json!({}), Priority::Standard);
        deps.queue.enqueue(&queued).await.unwrap();
        settle().await;

        let report = RecoveryScanner::new(deps.clone()).scan().await.unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.untouched, 1);
        assert_eq!(
            deps.store.get_job(job.id).await.unwrap().unwrap().state,
            JobState::Executing
        );
    }

    #[tokio::test]
    async fn unpublished_job_is_requeued() {
        let deps = deps().await;
        let job = Job::new(TaskType::ContentGeneration, json!({}), Priority::Critical);
        deps.store.insert_job(&job).await.unwrap();
        settle().await;

        let report = RecoveryScanner::new(deps.clone()).scan().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(
            deps.store.get_job(job.id).await.unwrap().unwrap().state,
            JobState::Queued
        );
    }
}
