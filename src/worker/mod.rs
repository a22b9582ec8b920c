//! Worker system: the execution pool and per-job workers.
//!
//! - `pool`: execution slots and the dispatch loop
//! - `worker`: runs one leased job to a verdict

pub mod pool;
pub mod worker;

pub use pool::WorkerPool;
pub use worker::Worker;
