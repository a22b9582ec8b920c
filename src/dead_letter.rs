//! Dead-letter store: terminal failures parked for operator review.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DatabaseError, ErrorKind, JobError};
use crate::jobs::{JobId, JobState, TaskType};
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::store::Database;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    Pending,
    /// Re-enqueued by an operator.
    Retried,
    /// Acknowledged without retry.
    Dismissed,
}

impl ResolutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retried => "retried",
            Self::Dismissed => "dismissed",
        }
    }
}

impl fmt::Display for ResolutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retried" => Ok(Self::Retried),
            "dismissed" => Ok(Self::Dismissed),
            other => Err(format!("unknown resolution status: {other}")),
        }
    }
}

/// One job that failed terminally. Keyed by job id; a job dead-lettered
/// again after a retry overwrites its previous entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: JobId,
    pub task_type: TaskType,
    /// Payload as submitted. A payload that could not be parsed is kept
    /// verbatim as a JSON string.
    pub original_payload: serde_json::Value,
    pub final_error: String,
    pub error_kind: ErrorKind,
    pub retry_count_at_failure: u32,
    pub failed_at: DateTime<Utc>,
    pub resolution_status: ResolutionStatus,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Filter for listing dead-letter entries, newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeadLetterFilter {
    #[serde(rename = "status")]
    pub resolution_status: Option<ResolutionStatus>,
    pub task_type: Option<TaskType>,
    pub limit: Option<usize>,
}

/// Operator actions over the dead-letter store.
pub struct DeadLetters {
    store: Arc<dyn Database>,
    queue: Arc<TaskQueue>,
    metrics: Arc<Metrics>,
}

impl DeadLetters {
    pub fn new(store: Arc<dyn Database>, queue: Arc<TaskQueue>, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            queue,
            metrics,
        }
    }

    pub async fn list(&self, filter: &DeadLetterFilter) -> Result<Vec<DeadLetterEntry>, DatabaseError> {
        self.store.list_dead_letters(filter).await
    }

    pub async fn get(&self, job_id: JobId) -> Result<DeadLetterEntry, JobError> {
        self.store
            .get_dead_letter(job_id)
            .await?
            .ok_or(JobError::DeadLetterNotFound { id: job_id })
    }

    /// Re-enqueue a dead-lettered job with a fresh retry budget.
    pub async fn retry(&self, job_id: JobId) -> Result<JobState, JobError> {
        let state = self.store.retry_dead_letter(job_id).await?;
        tracing::info!(%job_id, "Dead-lettered job re-enqueued by operator");
        self.queue.wake();
        Ok(state)
    }

    /// Acknowledge an entry. The job stays in `failed_dead`.
    pub async fn dismiss(&self, job_id: JobId) -> Result<DeadLetterEntry, JobError> {
        let entry = self.store.dismiss_dead_letter(job_id).await?;
        tracing::info!(%job_id, "Dead-letter entry dismissed");
        Ok(entry)
    }

    /// Refresh the pending gauge from the store.
    pub async fn refresh_gauge(&self) -> Result<usize, DatabaseError> {
        let pending = self
            .store
            .count_dead_letters(Some(ResolutionStatus::Pending))
            .await?;
        self.metrics.dead_letter_pending.set(pending as i64);
        Ok(pending)
    }
}
