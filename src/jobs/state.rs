//! Job state machine.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Durably recorded, not yet published to a partition.
    Pending,
    /// Waiting in a partition for a worker.
    Queued,
    /// Leased by a worker.
    Executing,
    Completed,
    /// Last attempt failed; the retry policy decides what happens next.
    Failed,
    /// Waiting out a backoff delay.
    Retrying,
    /// Moved to the dead-letter store.
    FailedDead,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        Self::Pending,
        Self::Queued,
        Self::Executing,
        Self::Completed,
        Self::Failed,
        Self::Retrying,
        Self::FailedDead,
        Self::Cancelled,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        if target == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, target),
            (Pending, Queued)
                | (Queued, Executing)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Failed, Retrying)
                | (Failed, FailedDead)
                | (Retrying, Queued)
        )
    }

    /// Operator-initiated revival of a dead-lettered job. Kept apart from
    /// `can_transition_to` so workers and recovery never take this edge.
    pub fn can_revive_to(&self, target: JobState) -> bool {
        matches!((self, target), (Self::FailedDead, Self::Queued))
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::FailedDead | Self::Cancelled)
    }

    /// Shortest chain of ordinary transitions from `self` to `target`,
    /// excluding `self`. Cancellation edges are never part of a route.
    ///
    /// Returns `Some(vec![])` when already at `target`, `None` when
    /// unreachable.
    pub fn route_to(self, target: JobState) -> Option<Vec<JobState>> {
        if self == target {
            return Some(Vec::new());
        }

        let mut previous: [Option<JobState>; 8] = [None; 8];
        let mut seen = [false; 8];
        let mut frontier = VecDeque::from([self]);
        seen[self.index()] = true;

        while let Some(state) = frontier.pop_front() {
            for next in Self::ALL {
                if next == Self::Cancelled || seen[next.index()] {
                    continue;
                }
                if !state.can_transition_to(next) {
                    continue;
                }
                seen[next.index()] = true;
                previous[next.index()] = Some(state);
                if next == target {
                    let mut route = vec![next];
                    let mut cursor = state;
                    while cursor != self {
                        route.push(cursor);
                        cursor = previous[cursor.index()]?;
                    }
                    route.reverse();
                    return Some(route);
                }
                frontier.push_back(next);
            }
        }

        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::FailedDead => "failed_dead",
            Self::Cancelled => "cancelled",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {s}"))
    }
}

/// One entry of a job's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    pub job_id: Uuid,
    /// Position in the job's history, starting at 1.
    pub sequence: u32,
    /// `None` for the record that created the job.
    pub from: Option<JobState>,
    pub to: JobState,
    pub at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

/// Check that a recorded history is a walk over valid edges with
/// non-decreasing timestamps, starting from creation.
pub fn is_valid_history(history: &[StateTransition]) -> bool {
    let Some(first) = history.first() else {
        return true;
    };
    if first.from.is_some() || first.to != JobState::Pending {
        return false;
    }

    history.windows(2).all(|pair| {
        let (prev, next) = (&pair[0], &pair[1]);
        let Some(from) = next.from else {
            return false;
        };
        from == prev.to
            && next.sequence == prev.sequence + 1
            && next.at >= prev.at
            && (from.can_transition_to(next.to) || from.can_revive_to(next.to))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobState::*;

    #[test]
    fn state_transitions_valid() {
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Retrying));
        assert!(Failed.can_transition_to(FailedDead));
        assert!(Retrying.can_transition_to(Queued));
    }

    #[test]
    fn state_transitions_invalid() {
        assert!(!Pending.can_transition_to(Executing));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Executing.can_transition_to(Queued));
        assert!(!Retrying.can_transition_to(Executing));
        assert!(!Completed.can_transition_to(Queued));
        assert!(!FailedDead.can_transition_to(Queued));
    }

    #[test]
    fn cancel_from_any_active_state() {
        for state in JobState::ALL {
            assert_eq!(state.can_transition_to(Cancelled), !state.is_terminal());
        }
    }

    #[test]
    fn terminal_states() {
        assert!(Completed.is_terminal());
        assert!(FailedDead.is_terminal());
        assert!(Cancelled.is_terminal());
        assert!(!Failed.is_terminal());
        assert!(!Retrying.is_terminal());
        assert!(!Executing.is_terminal());
    }

    #[test]
    fn revive_only_from_dead_letter() {
        assert!(FailedDead.can_revive_to(Queued));
        assert!(!Cancelled.can_revive_to(Queued));
        assert!(!FailedDead.can_revive_to(Executing));
    }

    #[test]
    fn routes_walk_valid_edges() {
        assert_eq!(Executing.route_to(Queued), Some(vec![Failed, Retrying, Queued]));
        assert_eq!(Queued.route_to(FailedDead), Some(vec![Executing, Failed, FailedDead]));
        assert_eq!(
            Pending.route_to(FailedDead),
            Some(vec![Queued, Executing, Failed, FailedDead])
        );
        assert_eq!(Retrying.route_to(Queued), Some(vec![Queued]));
        assert_eq!(Queued.route_to(Queued), Some(vec![]));
        assert_eq!(Completed.route_to(Queued), None);
        assert_eq!(Executing.route_to(Cancelled), None);
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }

    fn t(sequence: u32, from: Option<JobState>, to: JobState, secs: i64) -> StateTransition {
        StateTransition {
            job_id: Uuid::nil(),
            sequence,
            from,
            to,
            at: DateTime::from_timestamp(secs, 0).unwrap(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn history_validation() {
        let good = vec![
            t(1, None, Pending, 0),
            t(2, Some(Pending), Queued, 0),
            t(3, Some(Queued), Executing, 1),
            t(4, Some(Executing), Failed, 2),
            t(5, Some(Failed), FailedDead, 2),
            t(6, Some(FailedDead), Queued, 9),
        ];
        assert!(is_valid_history(&good));

        let skipped = vec![t(1, None, Pending, 0), t(2, Some(Pending), Executing, 1)];
        assert!(!is_valid_history(&skipped));

        let backwards = vec![t(1, None, Pending, 5), t(2, Some(Pending), Queued, 4)];
        assert!(!is_valid_history(&backwards));
    }
}
