//! Priority-partitioned task queue over the durable job store.
//!
//! Jobs live in the store; the queue only decides which partition a worker
//! drains next and wakes idle workers when new work is published.

pub mod partition;

pub use partition::{Partition, PartitionWeights, WeightedSelector};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{DatabaseError, JobError};
use crate::jobs::Job;
use crate::store::{Database, Ownership};

pub struct TaskQueue {
    store: Arc<dyn Database>,
    selector: Mutex<WeightedSelector>,
    notify: Notify,
}

impl TaskQueue {
    /// Queue draining `partitions` with weighted fairness between them.
    pub fn new(
        store: Arc<dyn Database>,
        partitions: &[Partition],
        weights: PartitionWeights,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            selector: Mutex::new(WeightedSelector::new(partitions, weights)),
            notify: Notify::new(),
        })
    }

    /// Persist the job and publish it to its partition.
    ///
    /// The record is durable before it becomes visible to workers. If the
    /// process dies between the two steps, recovery publishes the job.
    pub async fn enqueue(&self, job: &Job) -> Result<(), JobError> {
        self.store.insert_job(job).await?;
        self.store
            .requeue(job.id, Ownership::Any, json!({"reason": "published"}))
            .await?;

        info!(
            job_id = %job.id,
            task_type = %job.task_type,
            partition = %job.partition,
            priority = %job.priority,
            "Job enqueued"
        );
        self.wake();
        Ok(())
    }

    /// Lease the next job for `owner`, trying partitions in weighted order.
    pub async fn dequeue(&self, owner: &str, lease_ttl: Duration) -> Result<Option<Job>, JobError> {
        let order = self
            .selector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .next_order();

        for partition in order {
            if let Some(job) = self.store.claim_next(partition, owner, lease_ttl).await? {
                debug!(job_id = %job.id, %partition, owner, "Job dequeued");
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Wake one idle dispatcher.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Resolves on the next `wake`.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    /// Queued jobs per partition, in priority order.
    pub async fn depth(&self) -> Result<Vec<(Partition, usize)>, DatabaseError> {
        let mut depths = Vec::with_capacity(Partition::ALL.len());
        for partition in Partition::ALL {
            depths.push((partition, self.store.queue_depth(partition).await?));
        }
        Ok(depths)
    }

    pub fn partitions(&self) -> Vec<Partition> {
        self.selector
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .partitions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{JobState, Priority, TaskType};
    use crate::store::LibSqlBackend;

    const TTL: Duration = Duration::from_secs(60);

    async fn queue(partitions: &[Partition]) -> (Arc<dyn Database>, Arc<TaskQueue>) {
        let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = TaskQueue::new(Arc::clone(&store), partitions, PartitionWeights::default());
        (store, queue)
    }

    #[tokio::test]
    async fn enqueue_publishes_durably() {
        let (store, queue) = queue(&Partition::ALL).await;
        let job = Job::new(TaskType::CaptionGeneration, json!({"lang": "en"}), Priority::Standard);
        queue.enqueue(&job).await.unwrap();

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(queue.depth().await.unwrap()[1], (Partition::Media, 1));

        let leased = queue.dequeue("w1", TTL).await.unwrap().unwrap();
        assert_eq!(leased.id, job.id);
        assert!(queue.dequeue("w1", TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unsubscribed_partitions_are_not_drained() {
        let (_, queue) = queue(&[Partition::Generation]).await;
        queue
            .enqueue(&Job::new(TaskType::VideoRender, json!({}), Priority::Critical))
            .await
            .unwrap();
        assert!(queue.dequeue("w1", TTL).await.unwrap().is_none());
        assert_eq!(queue.partitions(), vec![Partition::Generation]);
    }

    #[tokio::test]
    async fn busy_partition_does_not_starve_batch() {
        let (_, queue) = queue(&[Partition::Generation, Partition::Batch]).await;
        for _ in 0..12 {
            queue
                .enqueue(&Job::new(TaskType::ContentGeneration, json!({}), Priority::Critical))
                .await
                .unwrap();
            queue
                .enqueue(&Job::new(TaskType::BatchGeneration, json!({}), Priority::Low))
                .await
                .unwrap();
        }

        // Weights 8 and 1: one batch job in every nine dequeues.
        let mut batch = 0;
        for _ in 0..9 {
            let job = queue.dequeue("w1", TTL).await.unwrap().unwrap();
            if job.partition == Partition::Batch {
                batch += 1;
            }
        }
        assert_eq!(batch, 1);
    }

    #[tokio::test]
    async fn wake_is_remembered_until_awaited() {
        let (_, queue) = queue(&Partition::ALL).await;
        queue.wake();
        tokio::time::timeout(Duration::from_secs(1), queue.notified())
            .await
            .unwrap();
    }
}
