//! jobwarden: reliable execution for long-running content jobs.
//!
//! Priority-partitioned queue, leased workers with time limits, retries
//! with jitter, per-dependency circuit breakers, checkpoint-based
//! recovery and a dead-letter store, all persisted in libSQL.

pub mod api;
pub mod breaker;
pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod deps;
pub mod error;
pub mod handler;
pub mod health;
pub mod jobs;
pub mod metrics;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod service;
pub mod store;
pub mod worker;
