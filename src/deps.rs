//! Shared dependencies injected into every component.
//!
//! Built once by the entry point (or a test) and cloned into the worker
//! pool, recovery scanner and service; nothing in the crate reaches for
//! process-global state.

use std::sync::Arc;

use crate::breaker::CircuitBreakers;
use crate::config::JobsConfig;
use crate::error::Error;
use crate::handler::HandlerRegistry;
use crate::metrics::Metrics;
use crate::queue::TaskQueue;
use crate::retry::RetryPolicy;
use crate::store::{Database, LibSqlBackend};

#[derive(Clone)]
pub struct Dependencies {
    pub config: Arc<JobsConfig>,
    pub store: Arc<dyn Database>,
    pub queue: Arc<TaskQueue>,
    pub handlers: Arc<HandlerRegistry>,
    pub breakers: Arc<CircuitBreakers>,
    pub retry: Arc<RetryPolicy>,
    pub metrics: Arc<Metrics>,
}

impl Dependencies {
    /// Wire components around an already opened store.
    pub fn new(
        config: JobsConfig,
        store: Arc<dyn Database>,
        handlers: HandlerRegistry,
    ) -> Result<Self, Error> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new()?);
        metrics.worker_slots.set(config.worker_slots as i64);

        let queue = TaskQueue::new(
            Arc::clone(&store),
            &config.partitions,
            config.partition_weights,
        );

        Ok(Self {
            breakers: Arc::new(CircuitBreakers::new(config.breaker.clone())),
            retry: Arc::new(RetryPolicy::new(config.retry.clone())),
            config: Arc::new(config),
            store,
            queue,
            handlers: Arc::new(handlers),
            metrics,
        })
    }

    /// Open the on-disk database named by the config, then wire.
    pub async fn open(config: JobsConfig, handlers: HandlerRegistry) -> Result<Self, Error> {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
        Self::new(config, store, handlers)
    }

    /// In-memory store, for tests and local experiments.
    pub async fn in_memory(config: JobsConfig, handlers: HandlerRegistry) -> Result<Self, Error> {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await?);
        Self::new(config, store, handlers)
    }
}
