//! The producer and operator contracts over one running subsystem.
//!
//! `JobService` owns the long-lived pieces (worker pool, recovery scanner,
//! reaper) and is what the HTTP layer and embedding code talk to.

use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dead_letter::{DeadLetterEntry, DeadLetterFilter, DeadLetters};
use crate::deps::Dependencies;
use crate::error::{Error, JobError};
use crate::health::{HealthReport, HealthReporter};
use crate::jobs::{Job, JobFilter, JobId, JobState, Priority, StateTransition, TaskType};
use crate::recovery::{RecoveryReport, RecoveryScanner, spawn_reaper};
use crate::worker::WorkerPool;

/// Body of a submission.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

pub struct JobService {
    deps: Dependencies,
    dead_letters: DeadLetters,
    recovery: Arc<RecoveryScanner>,
    pool: Arc<WorkerPool>,
    health: HealthReporter,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl JobService {
    pub fn new(deps: Dependencies) -> Arc<Self> {
        let recovery = RecoveryScanner::new(deps.clone());
        let pool = WorkerPool::new(deps.clone());
        Arc::new(Self {
            dead_letters: DeadLetters::new(
                Arc::clone(&deps.store),
                Arc::clone(&deps.queue),
                Arc::clone(&deps.metrics),
            ),
            health: HealthReporter::new(deps.clone(), Arc::clone(&recovery), Arc::clone(&pool)),
            recovery,
            pool,
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
            deps,
        })
    }

    pub fn deps(&self) -> &Dependencies {
        &self.deps
    }

    /// Run startup recovery, then begin dispatching. Nothing is executed
    /// before every stale job has been classified.
    pub async fn start(&self) -> Result<RecoveryReport, JobError> {
        let report = self.recovery.scan().await?;
        self.pool.start().await;

        if let Some(interval) = self.deps.config.recovery_interval {
            let mut reaper = self.reaper.lock().await;
            if reaper.is_none() {
                *reaper = Some(spawn_reaper(
                    Arc::clone(&self.recovery),
                    interval,
                    self.shutdown.clone(),
                ));
            }
        }

        info!(
            pool_id = %self.pool.pool_id(),
            recovered = report.released(),
            "Job service started"
        );
        Ok(report)
    }

    /// Stop the reaper and the pool. In-flight jobs are signalled and
    /// awaited; those that stop early are picked up by recovery later.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let reaper = self.reaper.lock().await.take();
        if let Some(reaper) = reaper
            && let Err(e) = reaper.await
        {
            error!(error = %e, "Recovery reaper ended abnormally");
        }
        self.pool.shutdown().await;
        info!("Job service stopped");
    }

    // -- producer contract --

    pub async fn submit(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Result<JobId, JobError> {
        if !self.deps.handlers.contains(task_type) {
            return Err(JobError::NoHandler {
                task_type: task_type.to_string(),
            });
        }

        let job = Job::new(task_type, payload, priority);
        self.deps.queue.enqueue(&job).await?;
        self.deps.metrics.record_submitted(task_type);
        info!(
            job_id = %job.id,
            %task_type,
            %priority,
            partition = %job.partition,
            "Job submitted"
        );
        Ok(job.id)
    }

    pub async fn submit_request(&self, request: SubmitRequest) -> Result<JobId, JobError> {
        self.submit(request.task_type, request.payload, request.priority)
            .await
    }

    /// Latest known state, including `last_error` while retries are pending.
    pub async fn status(&self, id: JobId) -> Result<Job, JobError> {
        self.deps
            .store
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })
    }

    /// Every transition the job went through, oldest first.
    pub async fn history(&self, id: JobId) -> Result<Vec<StateTransition>, JobError> {
        let transitions = self.deps.store.list_transitions(id).await?;
        if transitions.is_empty() && self.deps.store.get_job(id).await?.is_none() {
            return Err(JobError::NotFound { id });
        }
        Ok(transitions)
    }

    /// `true` if the job was live and is now cancelled; `false` if it had
    /// already finished.
    pub async fn cancel(&self, id: JobId) -> Result<bool, JobError> {
        let cancelled = self.deps.store.cancel_job(id, "cancelled by request").await?;
        if cancelled {
            self.deps.metrics.jobs_cancelled.inc();
            info!(job_id = %id, "Job cancelled");
        }
        Ok(cancelled)
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.deps.store.list_jobs(filter).await?)
    }

    // -- operator contract --

    pub async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> Result<Vec<DeadLetterEntry>, JobError> {
        Ok(self.dead_letters.list(filter).await?)
    }

    pub async fn dead_letter(&self, id: JobId) -> Result<DeadLetterEntry, JobError> {
        self.dead_letters.get(id).await
    }

    pub async fn retry_dead_letter(&self, id: JobId) -> Result<JobState, JobError> {
        self.dead_letters.retry(id).await
    }

    pub async fn dismiss_dead_letter(&self, id: JobId) -> Result<DeadLetterEntry, JobError> {
        self.dead_letters.dismiss(id).await
    }

    pub async fn trigger_recovery_scan(&self) -> Result<RecoveryReport, JobError> {
        info!("Recovery scan requested");
        self.recovery.scan().await
    }

    pub async fn health(&self) -> HealthReport {
        self.health.report().await
    }

    /// Whether a recovery pass has completed since start-up.
    pub fn recovered(&self) -> bool {
        self.recovery.is_complete()
    }

    pub async fn ready(&self) -> bool {
        self.health.ready().await
    }

    /// Prometheus text exposition, with the store-backed gauges refreshed.
    pub async fn metrics_text(&self) -> Result<String, Error> {
        let metrics = &self.deps.metrics;
        for (partition, depth) in self.deps.queue.depth().await? {
            metrics.set_queue_depth(partition, depth);
        }
        metrics.set_circuits(&self.deps.breakers.snapshot());
        self.dead_letters.refresh_gauge().await?;
        Ok(metrics.encode()?)
    }
}
