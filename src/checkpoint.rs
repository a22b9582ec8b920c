//! Checkpoints: durable stage markers a handler writes so an interrupted
//! job can resume after its last completed stage.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{DatabaseError, HandlerError, JobError};
use crate::jobs::JobId;
use crate::metrics::Metrics;
use crate::store::Database;

/// Version stamped on every checkpoint written by this build. Checkpoints
/// carrying another version are treated as corrupt.
pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

/// A validated checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub job_id: JobId,
    pub stage_name: String,
    /// Strictly increasing per job.
    pub sequence: u32,
    pub payload: serde_json::Value,
    pub saved_at: DateTime<Utc>,
    pub schema_version: u32,
}

/// A checkpoint row as persisted, before validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredCheckpoint {
    pub job_id: JobId,
    pub sequence: u32,
    pub stage_name: String,
    pub raw_payload: String,
    pub schema_version: u32,
    pub saved_at: DateTime<Utc>,
    /// Set by recovery when the checkpoint was found corrupt.
    pub discarded: bool,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CheckpointError {
    #[error("payload is not valid JSON: {0}")]
    Malformed(String),

    #[error("schema version {found} does not match {expected}")]
    SchemaMismatch { found: u32, expected: u32 },

    #[error("stage name is empty")]
    MissingStage,
}

impl StoredCheckpoint {
    /// Parse and check the row. Any failure means the checkpoint must not
    /// be resumed from.
    pub fn validate(&self) -> Result<Checkpoint, CheckpointError> {
        if self.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(CheckpointError::SchemaMismatch {
                found: self.schema_version,
                expected: CHECKPOINT_SCHEMA_VERSION,
            });
        }
        if self.stage_name.trim().is_empty() {
            return Err(CheckpointError::MissingStage);
        }
        let payload = serde_json::from_str(&self.raw_payload)
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;

        Ok(Checkpoint {
            job_id: self.job_id,
            stage_name: self.stage_name.clone(),
            sequence: self.sequence,
            payload,
            saved_at: self.saved_at,
            schema_version: self.schema_version,
        })
    }
}

/// Handle through which a running handler records checkpoints and
/// progress. Writes are conditional on the worker still holding the lease.
pub struct CheckpointWriter {
    store: Arc<dyn Database>,
    job_id: JobId,
    owner: String,
    next_sequence: Mutex<u32>,
    metrics: Option<Arc<Metrics>>,
}

impl CheckpointWriter {
    /// Continue numbering after every checkpoint the job has ever written,
    /// discarded ones included.
    pub async fn open(
        store: Arc<dyn Database>,
        job_id: JobId,
        owner: impl Into<String>,
    ) -> Result<Self, DatabaseError> {
        let latest = store.max_checkpoint_sequence(job_id).await?;
        Ok(Self {
            store,
            job_id,
            owner: owner.into(),
            next_sequence: Mutex::new(latest + 1),
            metrics: None,
        })
    }

    /// Count saved checkpoints in `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Persist a checkpoint for a completed stage and update progress
    /// (clamped to 100). Returns the sequence number written.
    ///
    /// A `cancelled` error means the job was cancelled or the lease was
    /// lost; the handler should stop.
    pub async fn save(
        &self,
        stage_name: &str,
        payload: serde_json::Value,
        progress: u8,
    ) -> Result<u32, HandlerError> {
        let mut next = self.next_sequence.lock().await;
        let checkpoint = Checkpoint {
            job_id: self.job_id,
            stage_name: stage_name.to_string(),
            sequence: *next,
            payload,
            saved_at: Utc::now(),
            schema_version: CHECKPOINT_SCHEMA_VERSION,
        };

        match self
            .store
            .save_checkpoint(&self.owner, &checkpoint, progress.min(100))
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    job_id = %self.job_id,
                    stage = stage_name,
                    sequence = checkpoint.sequence,
                    "Checkpoint saved"
                );
                *next += 1;
                if let Some(metrics) = &self.metrics {
                    metrics.checkpoints_saved.inc();
                }
                Ok(checkpoint.sequence)
            }
            Err(e @ (JobError::LeaseLost { .. } | JobError::Cancelled { .. })) => {
                Err(HandlerError::cancelled(e.to_string()))
            }
            Err(e) => Err(HandlerError::resource_unavailable(format!(
                "checkpoint write failed: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn stored(raw: &str, version: u32, stage: &str) -> StoredCheckpoint {
        StoredCheckpoint {
            job_id: Uuid::new_v4(),
            sequence: 2,
            stage_name: stage.to_string(),
            raw_payload: raw.to_string(),
            schema_version: version,
            saved_at: Utc::now(),
            discarded: false,
        }
    }

    #[test]
    fn valid_checkpoint_parses() {
        let cp = stored(r#"{"script":"draft"}"#, CHECKPOINT_SCHEMA_VERSION, "script")
            .validate()
            .unwrap();
        assert_eq!(cp.stage_name, "script");
        assert_eq!(cp.payload["script"], "draft");
        assert_eq!(cp.sequence, 2);
    }

    #[test]
    fn truncated_payload_is_corrupt() {
        let err = stored(r#"{"script":"dr"#, CHECKPOINT_SCHEMA_VERSION, "script")
            .validate()
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Malformed(_)));
    }

    #[test]
    fn foreign_schema_version_is_corrupt() {
        let err = stored("{}", CHECKPOINT_SCHEMA_VERSION + 1, "script")
            .validate()
            .unwrap_err();
        assert_eq!(
            err,
            CheckpointError::SchemaMismatch {
                found: CHECKPOINT_SCHEMA_VERSION + 1,
                expected: CHECKPOINT_SCHEMA_VERSION
            }
        );
    }

    #[test]
    fn blank_stage_is_corrupt() {
        assert_eq!(
            stored("{}", CHECKPOINT_SCHEMA_VERSION, "  ").validate(),
            Err(CheckpointError::MissingStage)
        );
    }
}
