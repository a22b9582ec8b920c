//! Worker pool: a fixed number of execution slots fed by one dispatcher.
//!
//! The dispatcher takes a slot before it claims a job, so a busy pool
//! leaves queued work to other processes instead of holding it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::deps::Dependencies;
use crate::jobs::Job;
use crate::metrics::Metrics;
use crate::worker::Worker;

pub struct WorkerPool {
    deps: Dependencies,
    pool_id: String,
    slots: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
    executions: AtomicU64,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Keeps the active count and gauge right even if an execution panics.
struct ActiveGuard {
    active: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
    _permit: OwnedSemaphorePermit,
}

impl ActiveGuard {
    fn new(active: Arc<AtomicUsize>, metrics: Arc<Metrics>, permit: OwnedSemaphorePermit) -> Self {
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics.workers_active.set(now as i64);
        Self {
            active,
            metrics,
            _permit: permit,
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.workers_active.set(now as i64);
    }
}

impl WorkerPool {
    pub fn new(deps: Dependencies) -> Arc<Self> {
        let capacity = deps.config.worker_slots;
        let short_id = Uuid::new_v4().simple().to_string();
        Arc::new(Self {
            pool_id: format!("pool-{}", &short_id[..8]),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            executions: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
            deps,
        })
    }

    /// Start dispatching. Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() || self.shutdown.is_cancelled() {
            return;
        }
        info!(
            pool_id = %self.pool_id,
            slots = self.capacity,
            partitions = ?self.deps.queue.partitions(),
            "Worker pool started"
        );
        *dispatcher = Some(tokio::spawn(Arc::clone(self).dispatch()));
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether the dispatcher is alive.
    pub async fn is_running(&self) -> bool {
        matches!(self.dispatcher.lock().await.as_ref(), Some(handle) if !handle.is_finished())
            && !self.shutdown.is_cancelled()
    }

    /// Stop claiming work, signal running handlers and wait for them.
    ///
    /// Handlers that stop on the signal leave their job leased; once the
    /// lease expires, recovery resumes it from its last checkpoint.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            error!(pool_id = %self.pool_id, error = %e, "Dispatcher ended abnormally");
        }
        info!(pool_id = %self.pool_id, "Worker pool stopped");
    }

    async fn dispatch(self: Arc<Self>) {
        let mut in_flight = JoinSet::new();

        loop {
            while let Some(result) = in_flight.try_join_next() {
                log_join(result);
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };

            let owner = format!(
                "{}:{}",
                self.pool_id,
                self.executions.fetch_add(1, Ordering::SeqCst)
            );
            match self.deps.queue.dequeue(&owner, self.deps.config.lease_ttl).await {
                Ok(Some(job)) => {
                    self.spawn_execution(&mut in_flight, job, owner, permit);
                    continue;
                }
                Ok(None) => debug!(pool_id = %self.pool_id, "No eligible jobs"),
                Err(e) => error!(pool_id = %self.pool_id, error = %e, "Dequeue failed"),
            }
            drop(permit);

            tokio::select! {
                _ = self.deps.queue.notified() => {}
                _ = tokio::time::sleep(self.deps.config.poll_interval) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!(
            pool_id = %self.pool_id,
            in_flight = in_flight.len(),
            "Worker pool draining"
        );
        while let Some(result) = in_flight.join_next().await {
            log_join(result);
        }
    }

    fn spawn_execution(
        &self,
        in_flight: &mut JoinSet<()>,
        job: Job,
        owner: String,
        permit: OwnedSemaphorePermit,
    ) {
        let guard = ActiveGuard::new(
            Arc::clone(&self.active),
            Arc::clone(&self.deps.metrics),
            permit,
        );
        let worker = Worker::new(self.deps.clone(), owner, self.shutdown.clone());
        in_flight.spawn(async move {
            let _guard = guard;
            worker.run(job).await;
        });
    }
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Job execution task failed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::config::JobsConfig;
    use crate::error::HandlerError;
    use crate::handler::{HandlerRegistry, TaskContext, TaskHandler};
    use crate::jobs::{JobState, Priority, TaskType};

    /// Records the highest number of overlapping executions.
    #[derive(Default)]
    struct Overlap {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    struct Probe(Arc<Overlap>);

    #[async_trait]
    impl TaskHandler for Probe {
        fn task_type(&self) -> TaskType {
            TaskType::Maintenance
        }

        async fn execute(&self, _payload: Value, _ctx: &TaskContext) -> Result<Value, HandlerError> {
            let now = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.0.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.0.running.fetch_sub(1, Ordering::SeqCst);
            Ok(json!({"done": true}))
        }
    }

    #[tokio::test]
    async fn never_runs_more_jobs_than_slots() {
        let overlap = Arc::new(Overlap::default());
        let mut handlers = HandlerRegistry::new();
        handlers.register(Arc::new(Probe(Arc::clone(&overlap)))).unwrap();
        let config = JobsConfig {
            worker_slots: 2,
            poll_interval: Duration::from_millis(5),
            ..JobsConfig::default()
        };
        let deps = Dependencies::in_memory(config, handlers).await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..6 {
            let job = Job::new(TaskType::Maintenance, json!({}), Priority::Standard);
            deps.queue.enqueue(&job).await.unwrap();
            ids.push(job.id);
        }

        let pool = WorkerPool::new(deps.clone());
        pool.start().await;
        assert!(pool.is_running().await);

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut done = 0;
                for id in &ids {
                    let job = deps.store.get_job(*id).await.unwrap().unwrap();
                    if job.state == JobState::Completed {
                        done += 1;
                    }
                }
                if done == ids.len() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("jobs did not complete");

        pool.shutdown().await;
        assert!(!pool.is_running().await);
        assert_eq!(pool.active(), 0);
        assert!(overlap.peak.load(Ordering::SeqCst) <= 2);
    }
}
