//! Ordered multi-stage execution with a checkpoint after every stage.

use async_trait::async_trait;

use crate::error::{ErrorKind, HandlerError};
use crate::handler::TaskContext;

/// One named step of a multi-stage handler. Each stage receives the
/// previous stage's output (the job payload for the first stage).
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stable name, stored in checkpoints.
    fn name(&self) -> &str;

    async fn run(
        &self,
        input: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Run `stages` in order, checkpointing each output.
///
/// When the context carries a resume checkpoint, execution continues with
/// the stage after the checkpointed one, fed the checkpoint payload.
/// Stages at or before the checkpoint are never run again.
pub async fn run_stages(
    stages: &[Box<dyn Stage>],
    payload: serde_json::Value,
    ctx: &TaskContext,
) -> Result<serde_json::Value, HandlerError> {
    let (start, mut carried) = match ctx.resume_from() {
        Some(checkpoint) => {
            let done = stages
                .iter()
                .position(|s| s.name() == checkpoint.stage_name)
                .ok_or_else(|| {
                    HandlerError::new(
                        ErrorKind::CheckpointCorrupt,
                        format!("checkpoint names unknown stage {}", checkpoint.stage_name),
                    )
                })?;
            tracing::info!(
                job_id = %ctx.job_id(),
                stage = %checkpoint.stage_name,
                sequence = checkpoint.sequence,
                "Resuming after checkpoint"
            );
            (done + 1, checkpoint.payload.clone())
        }
        None => (0, payload),
    };

    let total = stages.len().max(1);
    for (index, stage) in stages.iter().enumerate().skip(start) {
        ctx.ensure_active()?;
        carried = stage.run(carried, ctx).await?;
        let progress = ((index + 1) * 100 / total) as u8;
        ctx.checkpoint(stage.name(), carried.clone(), progress).await?;
    }
    Ok(carried)
}
