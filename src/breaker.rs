//! Per-dependency circuit breakers.
//!
//! A circuit opens after `failure_threshold` consecutive failures and
//! rejects calls for `cooldown`. The first call after the cool-down is
//! admitted as a single trial: success closes the circuit, failure
//! reopens it for another full cool-down.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::error::HandlerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStatus {
    /// Gauge encoding: closed 0, half-open 1, open 2.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

/// Point-in-time view of one dependency's circuit.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Circuit {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    opened_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            opened_wall: None,
            trial_in_flight: false,
        }
    }
}

impl Circuit {
    fn open(&mut self) {
        self.status = CircuitStatus::Open;
        self.opened_at = Some(Instant::now());
        self.opened_wall = Some(Utc::now());
        self.trial_in_flight = false;
    }
}

/// Registry of circuits keyed by dependency name. Circuits are created
/// lazily on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, Circuit>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Circuit>> {
        self.circuits.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask to call `dependency`. Fails fast with a `circuit_open` error
    /// while the circuit is open or a half-open trial is already running.
    /// The error's `retry_after` is the remaining cool-down, or a full
    /// cool-down while a trial is in flight.
    pub fn acquire(&self, dependency: &str) -> Result<CircuitPermit<'_>, HandlerError> {
        let mut circuits = self.lock();
        let circuit = circuits.entry(dependency.to_string()).or_default();

        let trial = match circuit.status {
            CircuitStatus::Closed => false,
            CircuitStatus::Open => {
                let elapsed = circuit.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.cooldown {
                    return Err(HandlerError::circuit_open(
                        dependency,
                        self.config.cooldown - elapsed,
                    ));
                }
                tracing::info!(dependency, "Circuit half-open, admitting trial call");
                circuit.status = CircuitStatus::HalfOpen;
                circuit.trial_in_flight = true;
                true
            }
            CircuitStatus::HalfOpen => {
                if circuit.trial_in_flight {
                    return Err(HandlerError::circuit_open(dependency, self.config.cooldown));
                }
                circuit.trial_in_flight = true;
                true
            }
        };

        Ok(CircuitPermit {
            breakers: self,
            dependency: dependency.to_string(),
            trial,
            settled: false,
        })
    }

    fn record_success(&self, dependency: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(dependency.to_string()).or_default();
        if circuit.status != CircuitStatus::Closed {
            tracing::info!(dependency, "Circuit closed");
        }
        *circuit = Circuit::default();
    }

    fn record_failure(&self, dependency: &str) {
        let mut circuits = self.lock();
        let circuit = circuits.entry(dependency.to_string()).or_default();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);

        match circuit.status {
            CircuitStatus::HalfOpen => {
                tracing::warn!(dependency, "Trial call failed, circuit reopened");
                circuit.open();
            }
            CircuitStatus::Closed if circuit.consecutive_failures >= self.config.failure_threshold => {
                tracing::warn!(
                    dependency,
                    failures = circuit.consecutive_failures,
                    "Circuit opened"
                );
                circuit.open();
            }
            // Calls admitted before the circuit opened may still report in.
            _ => {}
        }
    }

    fn release_trial(&self, dependency: &str) {
        if let Some(circuit) = self.lock().get_mut(dependency) {
            circuit.trial_in_flight = false;
        }
    }

    pub fn status(&self, dependency: &str) -> CircuitStatus {
        self.lock()
            .get(dependency)
            .map(|c| c.status)
            .unwrap_or(CircuitStatus::Closed)
    }

    /// Current state of every known circuit, sorted by dependency name.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshot: Vec<CircuitSnapshot> = self
            .lock()
            .iter()
            .map(|(name, c)| CircuitSnapshot {
                dependency: name.clone(),
                status: c.status,
                consecutive_failures: c.consecutive_failures,
                opened_at: c.opened_wall,
            })
            .collect();
        snapshot.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshot
    }
}

/// Admission to call a dependency. Settle it with [`success`](Self::success)
/// or [`failure`](Self::failure); dropping it unsettled records no verdict
/// and frees the half-open trial slot.
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breakers: &'a CircuitBreakers,
    dependency: String,
    trial: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breakers.record_success(&self.dependency);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breakers.record_failure(&self.dependency);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breakers.release_trial(&self.dependency);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        })
    }

    fn fail(b: &CircuitBreakers, dep: &str, times: u32) {
        for _ in 0..times {
            b.acquire(dep).unwrap().failure();
        }
    }

    #[test]
    fn opens_after_threshold() {
        let b = breakers();
        fail(&b, "llm", 4);
        assert_eq!(b.status("llm"), CircuitStatus::Closed);
        fail(&b, "llm", 1);
        assert_eq!(b.status("llm"), CircuitStatus::Open);

        let err = b.acquire("llm").unwrap_err();
        assert_eq!(err.kind, ErrorKind::CircuitOpen);
        assert!(err.retry_after.unwrap() <= Duration::from_secs(300));
    }

    #[test]
    fn success_resets_the_count() {
        let b = breakers();
        fail(&b, "llm", 4);
        b.acquire("llm").unwrap().success();
        fail(&b, "llm", 4);
        assert_eq!(b.status("llm"), CircuitStatus::Closed);
    }

    #[test]
    fn circuits_are_independent() {
        let b = breakers();
        fail(&b, "llm", 5);
        assert!(b.acquire("llm").is_err());
        assert!(b.acquire("render-farm").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_one_trial() {
        let b = breakers();
        fail(&b, "llm", 5);

        tokio::time::advance(Duration::from_secs(299)).await;
        assert!(b.acquire("llm").is_err());

        tokio::time::advance(Duration::from_secs(2)).await;
        let trial = b.acquire("llm").unwrap();
        assert!(trial.is_trial());
        assert_eq!(b.status("llm"), CircuitStatus::HalfOpen);
        let refused = b.acquire("llm").unwrap_err();
        assert_eq!(refused.kind, ErrorKind::CircuitOpen);
        assert_eq!(refused.retry_after, Some(Duration::from_secs(300)));

        trial.success();
        assert_eq!(b.status("llm"), CircuitStatus::Closed);
        assert!(b.acquire("llm").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens_for_full_cooldown() {
        let b = breakers();
        fail(&b, "llm", 5);
        tokio::time::advance(Duration::from_secs(301)).await;

        b.acquire("llm").unwrap().failure();
        assert_eq!(b.status("llm"), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(200)).await;
        let err = b.acquire("llm").unwrap_err();
        assert!(err.retry_after.unwrap() > Duration::from_secs(90));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_frees_the_slot() {
        let b = breakers();
        fail(&b, "llm", 5);
        tokio::time::advance(Duration::from_secs(301)).await;

        drop(b.acquire("llm").unwrap());
        assert_eq!(b.status("llm"), CircuitStatus::HalfOpen);
        assert!(b.acquire("llm").unwrap().is_trial());
    }

    #[test]
    fn snapshot_lists_known_circuits() {
        let b = breakers();
        fail(&b, "render-farm", 5);
        b.acquire("llm").unwrap().success();
        let snap = b.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].dependency, "llm");
        assert_eq!(snap[1].status, CircuitStatus::Open);
        assert!(snap[1].opened_at.is_some());
    }
}
