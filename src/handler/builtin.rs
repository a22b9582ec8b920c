//! Built-in handlers shipped with the service.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ErrorKind, HandlerError};
use crate::handler::{TaskContext, TaskHandler};
use crate::jobs::TaskType;

/// `maintenance` canary: exercises the pipeline end to end without touching
/// an external system.
///
/// Payload: `{"sleep_ms": 250, "fail": "network_timeout"}`, both optional.
pub struct CanaryHandler;

#[derive(Debug, Default, Deserialize)]
struct CanaryPayload {
    #[serde(default)]
    sleep_ms: u64,
    #[serde(default)]
    fail: Option<ErrorKind>,
}

#[async_trait]
impl TaskHandler for CanaryHandler {
    fn task_type(&self) -> TaskType {
        TaskType::Maintenance
    }

    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, HandlerError> {
        let payload: CanaryPayload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::invalid_input(format!("canary payload: {e}")))?;

        if payload.sleep_ms > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(payload.sleep_ms)) => {}
                _ = ctx.cancelled() => ctx.ensure_active()?,
            }
        }

        if let Some(kind) = payload.fail {
            return Err(HandlerError::new(kind, "canary failure requested"));
        }

        Ok(json!({"ok": true, "attempt": ctx.attempt()}))
    }
}
