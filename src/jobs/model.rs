//! Job records and the closed set of task types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::jobs::JobState;
use crate::queue::Partition;

pub type JobId = Uuid;

/// Priority class. Orders jobs within a partition.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    #[default]
    Standard,
    Low,
}

impl Priority {
    /// Sort key; lower is served first.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Critical => 0,
            Self::Standard => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "standard" => Ok(Self::Standard),
            "low" => Ok(Self::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

/// Kind of work a job performs. Handlers are registered per task type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    ContentGeneration,
    VideoRender,
    CaptionGeneration,
    ThumbnailRender,
    BatchGeneration,
    Maintenance,
}

impl TaskType {
    pub const ALL: [TaskType; 6] = [
        Self::ContentGeneration,
        Self::VideoRender,
        Self::CaptionGeneration,
        Self::ThumbnailRender,
        Self::BatchGeneration,
        Self::Maintenance,
    ];

    /// Partition a task type is routed to.
    pub fn partition(&self) -> Partition {
        match self {
            Self::ContentGeneration => Partition::Generation,
            Self::VideoRender | Self::CaptionGeneration | Self::ThumbnailRender => Partition::Media,
            Self::BatchGeneration => Partition::Batch,
            Self::Maintenance => Partition::Default,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ContentGeneration => "content_generation",
            Self::VideoRender => "video_render",
            Self::CaptionGeneration => "caption_generation",
            Self::ThumbnailRender => "thumbnail_render",
            Self::BatchGeneration => "batch_generation",
            Self::Maintenance => "maintenance",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown task type: {s}"))
    }
}

/// A unit of work as seen by producers and operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub task_type: TaskType,
    pub priority: Priority,
    pub partition: Partition,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// 0..=100.
    pub progress: u8,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Not dispatched before this instant (backoff).
    pub eligible_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    /// Handler output once completed.
    pub result: Option<serde_json::Value>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh job in `Pending`, routed by its task type.
    pub fn new(task_type: TaskType, payload: serde_json::Value, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_type,
            priority,
            partition: task_type.partition(),
            payload,
            state: JobState::Pending,
            progress: 0,
            retry_count: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
            eligible_at: now,
            last_error: None,
            last_error_kind: None,
            result: None,
            lease_owner: None,
            lease_expires_at: None,
        }
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobFilter {
    #[serde(alias = "status")]
    pub state: Option<JobState>,
    pub task_type: Option<TaskType>,
    pub limit: Option<usize>,
}
