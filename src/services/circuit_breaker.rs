//! Per-runner circuit breakers.
//!
//! Each runner gets a breaker driven by its failure ratio. An open breaker
//! rejects dispatches for the half-open timeout, then admits a single
//! probe; the probe's outcome closes or re-opens the breaker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::errors::{OrchestratorError, OrchestratorResult};

/// Breaker state, as reported to health endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Breaker {
    state: BreakerState,
    successes: u64,
    failures: u64,
    opened_at: Option<Instant>,
    /// A half-open probe is in flight.
    probing: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            successes: 0,
            failures: 0,
            opened_at: None,
            probing: false,
        }
    }

    fn failure_rate(&self) -> f64 {
        let attempts = self.successes + self.failures;
        if attempts == 0 {
            0.0
        } else {
            self.failures as f64 / attempts as f64
        }
    }
}

/// Registry of breakers, one per runner.
pub struct CircuitBreakerRegistry {
    threshold: f64,
    half_open_timeout: Duration,
    min_attempts: u64,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl CircuitBreakerRegistry {
    /// Attempts required before the failure ratio can trip the breaker.
    pub const DEFAULT_MIN_ATTEMPTS: u64 = 5;

    pub fn new(threshold: f64, half_open_timeout: Duration) -> Self {
        Self {
            threshold,
            half_open_timeout,
            min_attempts: Self::DEFAULT_MIN_ATTEMPTS,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_min_attempts(mut self, min_attempts: u64) -> Self {
        self.min_attempts = min_attempts;
        self
    }

    /// Check whether the runner may receive a dispatch. Transitions
    /// Open -> HalfOpen once the timeout has elapsed.
    pub async fn check(&self, runner_id: &str) -> OrchestratorResult<()> {
        self.check_at(runner_id, Instant::now()).await
    }

    async fn check_at(&self, runner_id: &str, now: Instant) -> OrchestratorResult<()> {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(runner_id.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = breaker
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or_default();
                if elapsed >= self.half_open_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    breaker.probing = true;
                    info!(runner = runner_id, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    Err(OrchestratorError::CircuitOpen(runner_id.to_string()))
                }
            }
            BreakerState::HalfOpen => {
                if breaker.probing {
                    Err(OrchestratorError::CircuitOpen(runner_id.to_string()))
                } else {
                    breaker.probing = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a dispatch success. Closes a half-open breaker and resets
    /// its counters.
    pub async fn record_success(&self, runner_id: &str) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(runner_id.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::HalfOpen => {
                *breaker = Breaker::new();
                info!(runner = runner_id, "circuit breaker closed after probe");
            }
            _ => breaker.successes += 1,
        }
    }

    /// Record a dispatch failure. Trips the breaker when the failure
    /// ratio crosses the threshold; re-opens a half-open breaker.
    pub async fn record_failure(&self, runner_id: &str) {
        self.record_failure_at(runner_id, Instant::now()).await;
    }

    async fn record_failure_at(&self, runner_id: &str, now: Instant) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers
            .entry(runner_id.to_string())
            .or_insert_with(Breaker::new);
        match breaker.state {
            BreakerState::HalfOpen => {
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(now);
                breaker.probing = false;
                breaker.failures += 1;
                warn!(runner = runner_id, "circuit breaker re-opened after failed probe");
            }
            BreakerState::Open => breaker.failures += 1,
            BreakerState::Closed => {
                breaker.failures += 1;
                let attempts = breaker.successes + breaker.failures;
                if attempts >= self.min_attempts && breaker.failure_rate() >= self.threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(now);
                    warn!(
                        runner = runner_id,
                        failure_rate = breaker.failure_rate(),
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    pub async fn state(&self, runner_id: &str) -> BreakerState {
        self.breakers
            .lock()
            .await
            .get(runner_id)
            .map_or(BreakerState::Closed, |b| b.state)
    }

    /// Snapshot of all non-closed breakers for health reporting.
    pub async fn open_breakers(&self) -> Vec<(String, BreakerState)> {
        self.breakers
            .lock()
            .await
            .iter()
            .filter(|(_, b)| b.state != BreakerState::Closed)
            .map(|(id, b)| (id.clone(), b.state))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(0.5, Duration::from_secs(60)).with_min_attempts(4)
    }

    #[tokio::test]
    async fn test_closed_by_default() {
        let reg = registry();
        assert!(reg.check("r1").await.is_ok());
        assert_eq!(reg.state("r1").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_opens_at_exact_threshold_with_min_attempts() {
        let reg = registry();
        // 2 successes, 1 failure: rate 0.33, only 3 attempts -> closed.
        reg.record_success("r1").await;
        reg.record_success("r1").await;
        reg.record_failure("r1").await;
        assert_eq!(reg.state("r1").await, BreakerState::Closed);

        // 4th attempt fails: rate exactly 0.5 with min attempts -> open.
        reg.record_failure("r1").await;
        assert_eq!(reg.state("r1").await, BreakerState::Open);
        assert!(reg.check("r1").await.is_err());
    }

    #[tokio::test]
    async fn test_stays_closed_below_min_attempts() {
        let reg = registry();
        reg.record_failure("r1").await;
        reg.record_failure("r1").await;
        reg.record_failure("r1").await;
        // Rate 1.0 but only 3 attempts.
        assert_eq!(reg.state("r1").await, BreakerState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_after_timeout_then_close() {
        let reg = registry();
        let start = Instant::now();
        for _ in 0..4 {
            reg.record_failure_at("r1", start).await;
        }
        assert_eq!(reg.state("r1").await, BreakerState::Open);

        // Before the timeout: rejected.
        assert!(reg
            .check_at("r1", start + Duration::from_secs(59))
            .await
            .is_err());

        // At exactly the timeout: the probe is admitted.
        assert!(reg
            .check_at("r1", start + Duration::from_secs(60))
            .await
            .is_ok());
        assert_eq!(reg.state("r1").await, BreakerState::HalfOpen);

        // A second request during the probe is rejected.
        assert!(reg
            .check_at("r1", start + Duration::from_secs(60))
            .await
            .is_err());

        // Probe success closes and resets.
        reg.record_success("r1").await;
        assert_eq!(reg.state("r1").await, BreakerState::Closed);
        assert!(reg.check("r1").await.is_ok());
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let reg = registry();
        let start = Instant::now();
        for _ in 0..4 {
            reg.record_failure_at("r1", start).await;
        }
        assert!(reg
            .check_at("r1", start + Duration::from_secs(61))
            .await
            .is_ok());

        let reopened_at = start + Duration::from_secs(62);
        reg.record_failure_at("r1", reopened_at).await;
        assert_eq!(reg.state("r1").await, BreakerState::Open);

        // The new open period counts from the re-open.
        assert!(reg
            .check_at("r1", reopened_at + Duration::from_secs(59))
            .await
            .is_err());
        assert!(reg
            .check_at("r1", reopened_at + Duration::from_secs(60))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_breakers_are_per_runner() {
        let reg = registry();
        for _ in 0..4 {
            reg.record_failure("r1").await;
        }
        assert!(reg.check("r1").await.is_err());
        assert!(reg.check("r2").await.is_ok());

        let open = reg.open_breakers().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0, "r1");
    }
}
