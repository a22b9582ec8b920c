//! Per-execution context handed to a handler.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::checkpoint::{Checkpoint, CheckpointWriter};
use crate::error::HandlerError;
use crate::jobs::JobId;

/// Why an execution was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The job was cancelled by a producer or operator.
    JobCancelled,
    SoftTimeLimit,
    /// Another owner took the job; results would be discarded.
    LeaseLost,
    Shutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::JobCancelled => "job cancelled",
            Self::SoftTimeLimit => "soft time limit reached",
            Self::LeaseLost => "lease lost",
            Self::Shutdown => "worker shutting down",
        })
    }
}

/// Cooperative cancellation signal. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, reason: CancelReason) {
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Resolves once cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

pub struct TaskContext {
    job_id: JobId,
    attempt: u32,
    resume: Option<Checkpoint>,
    checkpoints: CheckpointWriter,
    cancellation: Cancellation,
}

impl TaskContext {
    pub fn new(
        job_id: JobId,
        attempt: u32,
        resume: Option<Checkpoint>,
        checkpoints: CheckpointWriter,
        cancellation: Cancellation,
    ) -> Self {
        Self {
            job_id,
            attempt,
            resume,
            checkpoints,
            cancellation,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// 1 on first execution, `retry_count + 1` afterwards.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Last valid checkpoint, if this execution resumes an interrupted one.
    pub fn resume_from(&self) -> Option<&Checkpoint> {
        self.resume.as_ref()
    }

    /// Persist a stage boundary. Fails with a `cancelled` error once the
    /// job was cancelled or the lease is gone.
    pub async fn checkpoint(
        &self,
        stage_name: &str,
        payload: serde_json::Value,
        progress: u8,
    ) -> Result<u32, HandlerError> {
        self.ensure_active()?;
        self.checkpoints.save(stage_name, payload, progress).await
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// `Err(cancelled)` if the execution should stop.
    pub fn ensure_active(&self) -> Result<(), HandlerError> {
        match self.cancellation.reason() {
            Some(reason) => Err(HandlerError::cancelled(reason.to_string())),
            None if self.cancellation.is_cancelled() => Err(HandlerError::cancelled("cancelled")),
            None => Ok(()),
        }
    }

    /// Resolves once the execution is asked to stop.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }
}
