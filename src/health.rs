//! Liveness and readiness.
//!
//! Liveness only says the process answers. Readiness needs both stores and
//! the queue reachable and the startup recovery pass finished; the worker
//! pool and circuit breakers are reported but never block readiness.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::breaker::CircuitStatus;
use crate::deps::Dependencies;
use crate::recovery::RecoveryScanner;
use crate::worker::WorkerPool;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn healthy(detail: Option<String>) -> Self {
        Self {
            status: HealthState::Healthy,
            detail,
        }
    }

    fn with(status: HealthState, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
    pub status: HealthState,
    pub components: BTreeMap<&'static str, ComponentHealth>,
}

/// Components that must be healthy before the service takes work.
const READINESS_COMPONENTS: [&str; 4] = ["state_store", "checkpoint_store", "task_queue", "recovery"];

pub struct HealthReporter {
    deps: Dependencies,
    recovery: Arc<RecoveryScanner>,
    pool: Arc<WorkerPool>,
}

impl HealthReporter {
    pub fn new(deps: Dependencies, recovery: Arc<RecoveryScanner>, pool: Arc<WorkerPool>) -> Self {
        Self {
            deps,
            recovery,
            pool,
        }
    }

    pub fn live(&self) -> bool {
        true
    }

    pub async fn ready(&self) -> bool {
        self.report().await.ready
    }

    pub async fn report(&self) -> HealthReport {
        let mut components = BTreeMap::new();

        components.insert(
            "state_store",
            match self.deps.store.ping().await {
                Ok(()) => ComponentHealth::healthy(None),
                Err(e) => ComponentHealth::with(HealthState::Unhealthy, e.to_string()),
            },
        );
        components.insert(
            "checkpoint_store",
            match self.deps.store.ping_checkpoints().await {
                Ok(()) => ComponentHealth::healthy(None),
                Err(e) => ComponentHealth::with(HealthState::Unhealthy, e.to_string()),
            },
        );
        components.insert(
            "task_queue",
            match self.deps.queue.depth().await {
                Ok(depths) => {
                    let queued: usize = depths.iter().map(|(_, depth)| depth).sum();
                    ComponentHealth::healthy(Some(format!("{queued} queued")))
                }
                Err(e) => ComponentHealth::with(HealthState::Unhealthy, e.to_string()),
            },
        );
        components.insert(
            "recovery",
            if self.recovery.is_complete() {
                ComponentHealth::healthy(None)
            } else {
                ComponentHealth::with(HealthState::Unhealthy, "startup recovery pending")
            },
        );

        let busy = format!("{}/{} slots busy", self.pool.active(), self.pool.capacity());
        components.insert(
            "worker_pool",
            if self.pool.is_running().await {
                ComponentHealth::healthy(Some(busy))
            } else {
                ComponentHealth::with(HealthState::Degraded, format!("not dispatching, {busy}"))
            },
        );

        let open: Vec<String> = self
            .deps
            .breakers
            .snapshot()
            .into_iter()
            .filter(|c| c.status != CircuitStatus::Closed)
            .map(|c| format!("{} {}", c.dependency, circuit_label(c.status)))
            .collect();
        components.insert(
            "circuit_breakers",
            if open.is_empty() {
                ComponentHealth::healthy(None)
            } else {
                ComponentHealth::with(HealthState::Degraded, open.join(", "))
            },
        );

        let ready = READINESS_COMPONENTS.iter().all(|name| {
            components
                .get(name)
                .is_some_and(|c| c.status == HealthState::Healthy)
        });
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthState::Healthy);

        HealthReport {
            live: self.live(),
            ready,
            status,
            components,
        }
    }
}

fn circuit_label(status: CircuitStatus) -> &'static str {
    match status {
        CircuitStatus::Closed => "closed",
        CircuitStatus::Open => "open",
        CircuitStatus::HalfOpen => "half_open",
    }
}
