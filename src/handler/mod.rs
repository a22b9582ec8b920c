//! Handler abstraction: the capability every task type implements.

pub mod builtin;
pub mod context;
pub mod registry;
pub mod stages;

pub use context::{CancelReason, Cancellation, TaskContext};
pub use registry::HandlerRegistry;
pub use stages::{Stage, run_stages};

use async_trait::async_trait;

use crate::error::HandlerError;
use crate::jobs::TaskType;

/// Executes jobs of one task type.
///
/// Handlers run at-least-once: a job may be executed again after a crash,
/// a lost lease or a retry, so side effects must be idempotent.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    /// External dependency guarded by a circuit breaker, if any.
    fn dependency(&self) -> Option<&str> {
        None
    }

    /// Run the job. Multi-stage handlers checkpoint through `ctx` after
    /// every stage and resume from `ctx.resume_from()`.
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError>;
}
