//! Prometheus metrics, registered on a private registry and exposed
//! through [`Metrics::encode`].

use std::time::Duration;

use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::breaker::CircuitSnapshot;
use crate::error::ErrorKind;
use crate::jobs::TaskType;
use crate::queue::Partition;

pub struct Metrics {
    registry: Registry,

    pub jobs_submitted: IntCounterVec,
    pub jobs_completed: IntCounterVec,
    pub jobs_failed: IntCounterVec,
    pub jobs_retried: IntCounterVec,
    pub jobs_deferred: IntCounterVec,
    pub jobs_dead_lettered: IntCounterVec,
    pub jobs_cancelled: IntCounter,
    pub job_duration: HistogramVec,

    pub queue_depth: IntGaugeVec,
    pub dead_letter_pending: IntGauge,
    pub workers_active: IntGauge,
    pub worker_slots: IntGauge,

    pub circuit_state: IntGaugeVec,
    pub checkpoints_saved: IntCounter,
    pub recovery_outcomes: IntCounterVec,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    collector: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(collector.clone()))?;
    Ok(collector)
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let jobs_submitted = register(
            &registry,
            IntCounterVec::new(
                Opts::new("jobwarden_jobs_submitted_total", "Jobs accepted from producers"),
                &["task_type"],
            )?,
        )?;
        let jobs_completed = register(
            &registry,
            IntCounterVec::new(
                Opts::new("jobwarden_jobs_completed_total", "Jobs that completed"),
                &["task_type"],
            )?,
        )?;
        let jobs_failed = register(
            &registry,
            IntCounterVec::new(
                Opts::new("jobwarden_job_failures_total", "Failed execution attempts"),
                &["task_type", "error_kind"],
            )?,
        )?;
        let jobs_retried = register(
            &registry,
            IntCounterVec::new(
                Opts::new("jobwarden_jobs_retried_total", "Retries scheduled"),
                &["task_type"],
            )?,
        )?;
        let jobs_deferred = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "jobwarden_jobs_deferred_total",
                    "Attempts put back because a circuit was open",
                ),
                &["task_type"],
            )?,
        )?;
        let jobs_dead_lettered = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "jobwarden_jobs_dead_lettered_total",
                    "Jobs moved to the dead-letter store",
                ),
                &["task_type", "error_kind"],
            )?,
        )?;
        let jobs_cancelled = register(
            &registry,
            IntCounter::new("jobwarden_jobs_cancelled_total", "Jobs cancelled")?,
        )?;
        let job_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "jobwarden_job_duration_seconds",
                    "Wall time of one execution attempt",
                )
                .buckets(vec![
                    0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1500.0, 1800.0,
                ]),
                &["task_type", "outcome"],
            )?,
        )?;
        let queue_depth = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("jobwarden_queue_depth", "Queued jobs per partition"),
                &["partition"],
            )?,
        )?;
        let dead_letter_pending = register(
            &registry,
            IntGauge::new(
                "jobwarden_dead_letter_pending",
                "Dead-letter entries awaiting an operator",
            )?,
        )?;
        let workers_active = register(
            &registry,
            IntGauge::new("jobwarden_workers_active", "Jobs currently executing")?,
        )?;
        let worker_slots = register(
            &registry,
            IntGauge::new("jobwarden_worker_slots", "Configured execution slots")?,
        )?;
        let circuit_state = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(
                    "jobwarden_circuit_state",
                    "Circuit state per dependency (0 closed, 1 half-open, 2 open)",
                ),
                &["dependency"],
            )?,
        )?;
        let checkpoints_saved = register(
            &registry,
            IntCounter::new("jobwarden_checkpoints_saved_total", "Checkpoints written")?,
        )?;
        let recovery_outcomes = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "jobwarden_recovery_outcomes_total",
                    "Stale jobs handled by recovery, by outcome",
                ),
                &["outcome"],
            )?,
        )?;

        Ok(Self {
            registry,
            jobs_submitted,
            jobs_completed,
            jobs_failed,
            jobs_retried,
            jobs_deferred,
            jobs_dead_lettered,
            jobs_cancelled,
            job_duration,
            queue_depth,
            dead_letter_pending,
            workers_active,
            worker_slots,
            circuit_state,
            checkpoints_saved,
            recovery_outcomes,
        })
    }

    pub fn record_submitted(&self, task_type: TaskType) {
        self.jobs_submitted
            .with_label_values(&[task_type.as_str()])
            .inc();
    }

    pub fn record_completed(&self, task_type: TaskType, elapsed: Duration) {
        self.jobs_completed
            .with_label_values(&[task_type.as_str()])
            .inc();
        self.job_duration
            .with_label_values(&[task_type.as_str(), "completed"])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, task_type: TaskType, kind: ErrorKind, elapsed: Duration) {
        self.jobs_failed
            .with_label_values(&[task_type.as_str(), kind.as_str()])
            .inc();
        self.job_duration
            .with_label_values(&[task_type.as_str(), "failed"])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_retry(&self, task_type: TaskType) {
        self.jobs_retried
            .with_label_values(&[task_type.as_str()])
            .inc();
    }

    pub fn record_deferred(&self, task_type: TaskType) {
        self.jobs_deferred
            .with_label_values(&[task_type.as_str()])
            .inc();
    }

    pub fn record_dead_lettered(&self, task_type: TaskType, kind: ErrorKind) {
        self.jobs_dead_lettered
            .with_label_values(&[task_type.as_str(), kind.as_str()])
            .inc();
    }

    pub fn record_recovery(&self, outcome: &str) {
        self.recovery_outcomes.with_label_values(&[outcome]).inc();
    }

    pub fn set_queue_depth(&self, partition: Partition, depth: usize) {
        self.queue_depth
            .with_label_values(&[partition.as_str()])
            .set(depth as i64);
    }

    pub fn set_circuits(&self, circuits: &[CircuitSnapshot]) {
        for circuit in circuits {
            self.circuit_state
                .with_label_values(&[circuit.dependency.as_str()])
                .set(circuit.status.as_gauge());
        }
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
