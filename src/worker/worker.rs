//! Per-job worker execution.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointWriter};
use crate::deps::Dependencies;
use crate::error::{ErrorKind, HandlerError, JobError};
use crate::handler::{CancelReason, Cancellation, TaskContext, TaskHandler};
use crate::jobs::{Job, JobId, JobState};
use crate::retry::RetryDecision;
use crate::store::{Database, Ownership};

/// Shortest lease heartbeat, so tiny test TTLs do not spin.
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// How one execution ended.
#[derive(Debug)]
enum Outcome {
    Succeeded(serde_json::Value),
    Failed(HandlerError),
    /// The breaker refused the call, so the handler never ran.
    Refused(HandlerError),
    /// Stopped without a verdict: the job was cancelled, the lease was
    /// lost or the worker is shutting down.
    Abandoned(CancelReason),
}

/// Worker that executes a single leased job.
pub struct Worker {
    deps: Dependencies,
    owner: String,
    shutdown: CancellationToken,
}

impl Worker {
    /// `owner` is the lease owner id the job was claimed under.
    pub fn new(deps: Dependencies, owner: String, shutdown: CancellationToken) -> Self {
        Self {
            deps,
            owner,
            shutdown,
        }
    }

    /// Execute the job and record the outcome. Never panics on handler
    /// failure; store errors are logged and left for recovery.
    pub async fn run(&self, job: Job) {
        let started = Instant::now();
        info!(
            job_id = %job.id,
            task_type = %job.task_type,
            attempt = job.retry_count + 1,
            owner = %self.owner,
            "Executing job"
        );

        let outcome = self.execute(&job).await;
        if let Err(e) = self.settle(&job, outcome, started.elapsed()).await {
            error!(job_id = %job.id, error = %e, "Failed to record job outcome");
        }
    }

    async fn execute(&self, job: &Job) -> Outcome {
        let Some(handler) = self.deps.handlers.get(job.task_type) else {
            return Outcome::Failed(HandlerError::invalid_input(format!(
                "no handler registered for {}",
                job.task_type
            )));
        };

        let resume = match self.resume_point(job.id).await {
            Ok(resume) => resume,
            Err(e) => return Outcome::Failed(e),
        };

        let permit = match handler.dependency() {
            Some(dependency) => match self.deps.breakers.acquire(dependency) {
                Ok(permit) => Some(permit),
                Err(open) => {
                    debug!(job_id = %job.id, dependency, "Circuit open, skipping call");
                    return Outcome::Refused(open);
                }
            },
            None => None,
        };

        let outcome = self.invoke(handler.as_ref(), job, resume).await;

        if let Some(permit) = permit {
            match &outcome {
                Outcome::Failed(e) if e.kind.counts_against_dependency() => permit.failure(),
                Outcome::Abandoned(_) => drop(permit),
                _ => permit.success(),
            }
        }
        outcome
    }

    /// Latest valid checkpoint. A corrupt one is terminal.
    async fn resume_point(&self, id: JobId) -> Result<Option<Checkpoint>, HandlerError> {
        let stored = self
            .deps
            .store
            .latest_checkpoint(id)
            .await
            .map_err(|e| HandlerError::resource_unavailable(format!("checkpoint read failed: {e}")))?;

        match stored {
            Some(stored) => stored.validate().map(Some).map_err(|e| {
                HandlerError::new(
                    ErrorKind::CheckpointCorrupt,
                    format!("checkpoint {} unusable: {e}", stored.sequence),
                )
            }),
            None => Ok(None),
        }
    }

    /// Run the handler under the lease heartbeat and both time limits.
    async fn invoke(
        &self,
        handler: &dyn TaskHandler,
        job: &Job,
        resume: Option<Checkpoint>,
    ) -> Outcome {
        let config = &self.deps.config;
        let writer = match CheckpointWriter::open(Arc::clone(&self.deps.store), job.id, &self.owner)
            .await
        {
            Ok(writer) => writer.with_metrics(Arc::clone(&self.deps.metrics)),
            Err(e) => {
                return Outcome::Failed(HandlerError::resource_unavailable(format!(
                    "checkpoint store unavailable: {e}"
                )));
            }
        };

        let cancellation = Cancellation::new();
        let ctx = TaskContext::new(
            job.id,
            job.retry_count + 1,
            resume,
            writer,
            cancellation.clone(),
        );

        let supervisor = tokio::spawn(supervise(Supervision {
            store: Arc::clone(&self.deps.store),
            job_id: job.id,
            owner: self.owner.clone(),
            lease_ttl: config.lease_ttl,
            soft_limit: config.soft_time_limit,
            cancellation: cancellation.clone(),
            shutdown: self.shutdown.clone(),
        }));

        let execution = AssertUnwindSafe(handler.execute(job.payload.clone(), &ctx)).catch_unwind();
        let result = tokio::time::timeout(config.hard_time_limit, execution).await;
        supervisor.abort();

        match result {
            Err(_) => {
                warn!(job_id = %job.id, limit_secs = config.hard_time_limit.as_secs(), "Hard time limit exceeded");
                Outcome::Failed(HandlerError::new(
                    ErrorKind::TimeLimitExceeded,
                    format!("hard time limit of {}s exceeded", config.hard_time_limit.as_secs()),
                ))
            }
            Ok(Err(_)) => {
                error!(job_id = %job.id, "Handler panicked");
                Outcome::Failed(HandlerError::resource_unavailable("handler panicked"))
            }
            Ok(Ok(Ok(value))) => Outcome::Succeeded(value),
            Ok(Ok(Err(e))) if e.kind == ErrorKind::Cancelled => match cancellation.reason() {
                Some(CancelReason::SoftTimeLimit) => Outcome::Failed(HandlerError::new(
                    ErrorKind::TimeLimitExceeded,
                    format!("stopped at soft time limit: {}", e.message),
                )),
                Some(reason) => Outcome::Abandoned(reason),
                // Checkpoint writes report cancellation before the heartbeat does.
                None => Outcome::Abandoned(CancelReason::JobCancelled),
            },
            Ok(Ok(Err(e))) => Outcome::Failed(e),
        }
    }

    async fn settle(&self, job: &Job, outcome: Outcome, elapsed: Duration) -> Result<(), JobError> {
        let store = &self.deps.store;
        let metrics = &self.deps.metrics;
        let owner = Ownership::Owner(&self.owner);

        let error = match outcome {
            Outcome::Succeeded(value) => {
                return match store.complete_job(job.id, &self.owner, &value).await {
                    Ok(()) => {
                        info!(job_id = %job.id, elapsed_ms = elapsed.as_millis() as u64, "Job completed");
                        metrics.record_completed(job.task_type, elapsed);
                        Ok(())
                    }
                    Err(e) => self.discarded(job.id, e),
                };
            }
            Outcome::Abandoned(reason) => {
                info!(job_id = %job.id, %reason, "Execution abandoned");
                return Ok(());
            }
            Outcome::Refused(error) => {
                let after = self.deps.retry.deferral(&error);
                return match store.defer(job.id, owner, &error, after).await {
                    Ok(()) => {
                        info!(
                            job_id = %job.id,
                            retry_count = job.retry_count,
                            delay_ms = after.as_millis() as u64,
                            error = %error.message,
                            "Job deferred"
                        );
                        metrics.record_deferred(job.task_type);
                        Ok(())
                    }
                    Err(e) => self.discarded(job.id, e),
                };
            }
            Outcome::Failed(error) => error,
        };

        metrics.record_failure(job.task_type, error.kind, elapsed);
        let attempt = job.retry_count + 1;

        match self.deps.retry.decide_for(&error, attempt) {
            RetryDecision::Retry { after } => {
                match store.schedule_retry(job.id, owner, &error, after).await {
                    Ok(retry_count) => {
                        warn!(
                            job_id = %job.id,
                            attempt,
                            retry_count,
                            delay_ms = after.as_millis() as u64,
                            error_kind = %error.kind,
                            error = %error.message,
                            "Job failed, retry scheduled"
                        );
                        metrics.record_retry(job.task_type);
                        Ok(())
                    }
                    Err(e) => self.discarded(job.id, e),
                }
            }
            RetryDecision::Terminal { kind } => {
                match store.dead_letter(job.id, owner, &error, kind).await {
                    Ok(entry) => {
                        error!(
                            job_id = %job.id,
                            error_kind = %kind,
                            retry_count = entry.retry_count_at_failure,
                            error = %error,
                            "Job dead-lettered"
                        );
                        metrics.record_dead_lettered(job.task_type, kind);
                        Ok(())
                    }
                    Err(e) => self.discarded(job.id, e),
                }
            }
        }
    }

    /// Writes refused because the job moved on without us are expected
    /// under at-least-once delivery.
    fn discarded(&self, id: JobId, e: JobError) -> Result<(), JobError> {
        match e {
            JobError::LeaseLost { .. }
            | JobError::InvalidTransition {
                from: JobState::Cancelled,
                ..
            } => {
                warn!(job_id = %id, owner = %self.owner, error = %e, "Result discarded, job no longer owned");
                Ok(())
            }
            other => Err(other),
        }
    }
}

struct Supervision {
    store: Arc<dyn Database>,
    job_id: JobId,
    owner: String,
    lease_ttl: Duration,
    soft_limit: Duration,
    cancellation: Cancellation,
    shutdown: CancellationToken,
}

/// Renew the lease every third of its TTL, fire the soft limit and relay
/// shutdown. Runs until aborted by the worker.
async fn supervise(s: Supervision) {
    let period = (s.lease_ttl / 3).max(MIN_HEARTBEAT);
    let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let soft_limit = tokio::time::sleep(s.soft_limit);
    tokio::pin!(soft_limit);
    let mut soft_fired = false;
    let mut shutdown_seen = false;

    loop {
        tokio::select! {
            _ = &mut soft_limit, if !soft_fired => {
                soft_fired = true;
                warn!(job_id = %s.job_id, limit_secs = s.soft_limit.as_secs(), "Soft time limit reached, cancelling handler");
                s.cancellation.cancel(CancelReason::SoftTimeLimit);
            }
            _ = s.shutdown.cancelled(), if !shutdown_seen => {
                shutdown_seen = true;
                s.cancellation.cancel(CancelReason::Shutdown);
            }
            _ = heartbeat.tick() => {
                match s.store.renew_lease(s.job_id, &s.owner, s.lease_ttl).await {
                    Ok(JobState::Cancelled) => {
                        if !s.cancellation.is_cancelled() {
                            info!(job_id = %s.job_id, "Job cancelled, stopping handler");
                        }
                        s.cancellation.cancel(CancelReason::JobCancelled);
                    }
                    Ok(_) => debug!(job_id = %s.job_id, "Lease renewed"),
                    Err(JobError::LeaseLost { .. }) => {
                        warn!(job_id = %s.job_id, owner = %s.owner, "Lease lost, stopping handler");
                        s.cancellation.cancel(CancelReason::LeaseLost);
                        return;
                    }
                    Err(e) => warn!(job_id = %s.job_id, error = %e, "Lease renewal failed"),
                }
            }
        }
    }
}
