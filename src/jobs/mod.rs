//! Jobs: the record a producer submits and the state machine it moves through.
//!
//! - `model`: `Job`, `TaskType`, `Priority`
//! - `state`: `JobState` transitions and the `StateTransition` audit entry

pub mod model;
pub mod state;

pub use model::{Job, JobFilter, JobId, Priority, TaskType};
pub use state::{JobState, StateTransition, is_valid_history};
