//! Submission throttling.
//!
//! Submissions throttle per `repo:workflow` key. Each key carries a
//! per-second token bucket whose capacity is the configured burst, plus a
//! fixed per-minute window counter. Admission consumes from both or
//! neither.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::domain::models::ThrottlingConfig;

/// Tolerance for accumulated float error in token refill.
const TOKEN_EPSILON: f64 = 1e-9;

/// A token bucket with continuous refill.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0 - TOKEN_EPSILON
    }

    /// Seconds until one token is available, assuming refill was just run.
    fn wait_secs(&self) -> f64 {
        if self.has_token() {
            0.0
        } else {
            (1.0 - self.tokens) / self.refill_rate
        }
    }
}

/// Per-key throttle state.
#[derive(Debug, Clone, Copy)]
struct KeyState {
    second: Bucket,
    minute_window_start: Instant,
    minute_count: u32,
    last_seen: Instant,
}

/// Throttles submissions per `(repository, workflow)` key.
pub struct Throttle {
    config: ThrottlingConfig,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl Throttle {
    /// Idle keys older than this are pruned on access.
    const IDLE_EVICTION: Duration = Duration::from_secs(600);

    const MINUTE_WINDOW: Duration = Duration::from_secs(60);

    pub fn new(config: ThrottlingConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    fn make_state(&self, now: Instant) -> KeyState {
        KeyState {
            second: Bucket::new(
                f64::from(self.config.burst.max(1)),
                f64::from(self.config.requests_per_second.max(1)),
                now,
            ),
            minute_window_start: now,
            minute_count: 0,
            last_seen: now,
        }
    }

    /// Non-blocking admission check.
    pub async fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now()).await
    }

    async fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let rpm = self.config.requests_per_minute;
        let mut keys = self.keys.lock().await;
        if keys.len() > 4096 {
            keys.retain(|_, s| now.duration_since(s.last_seen) < Self::IDLE_EVICTION);
        }
        let state = keys
            .entry(key.to_string())
            .or_insert_with(|| self.make_state(now));
        state.last_seen = now;
        state.second.refill(now);
        if now.duration_since(state.minute_window_start) >= Self::MINUTE_WINDOW {
            state.minute_window_start = now;
            state.minute_count = 0;
        }

        if state.second.has_token() && state.minute_count < rpm {
            state.second.tokens -= 1.0;
            state.minute_count += 1;
            true
        } else {
            false
        }
    }

    /// Wait until admission succeeds, then consume.
    pub async fn acquire(&self, key: &str) {
        loop {
            let wait = {
                let rpm = self.config.requests_per_minute;
                let mut keys = self.keys.lock().await;
                let now = Instant::now();
                let state = keys
                    .entry(key.to_string())
                    .or_insert_with(|| self.make_state(now));
                state.last_seen = now;
                state.second.refill(now);
                if now.duration_since(state.minute_window_start) >= Self::MINUTE_WINDOW {
                    state.minute_window_start = now;
                    state.minute_count = 0;
                }
                if state.second.has_token() && state.minute_count < rpm {
                    state.second.tokens -= 1.0;
                    state.minute_count += 1;
                    return;
                }
                let minute_wait = if state.minute_count >= rpm {
                    (Self::MINUTE_WINDOW
                        .saturating_sub(now.duration_since(state.minute_window_start)))
                    .as_secs_f64()
                } else {
                    0.0
                };
                state.second.wait_secs().max(minute_wait)
            };
            sleep(Duration::from_secs_f64(wait.max(0.005))).await;
        }
    }

    /// Admissions immediately available for a key, for reporting.
    pub async fn available(&self, key: &str) -> f64 {
        let mut keys = self.keys.lock().await;
        let now = Instant::now();
        match keys.get_mut(key) {
            Some(state) => {
                state.second.refill(now);
                let minute_left =
                    f64::from(self.config.requests_per_minute.saturating_sub(state.minute_count));
                state.second.tokens.min(minute_left)
            }
            None => f64::from(self.config.burst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(rps: u32, rpm: u32, burst: u32) -> ThrottlingConfig {
        ThrottlingConfig {
            requests_per_second: rps,
            requests_per_minute: rpm,
            burst,
        }
    }

    #[tokio::test]
    async fn test_burst_admitted_immediately() {
        let throttle = Throttle::new(config(10, 600, 20));
        let now = Instant::now();
        let mut admitted = 0;
        for _ in 0..30 {
            if throttle.try_acquire_at("acme/web:build", now).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
    }

    #[tokio::test]
    async fn test_saturated_second_window_admits_exactly_rps() {
        let throttle = Throttle::new(config(10, 6000, 10));
        let start = Instant::now();

        // Drain the initial burst.
        for _ in 0..10 {
            assert!(throttle.try_acquire_at("k", start).await);
        }
        assert!(!throttle.try_acquire_at("k", start).await);

        // Over the next full second, saturated arrivals admit exactly rps.
        let mut admitted = 0;
        for ms in 1..=1000u64 {
            let at = start + Duration::from_millis(ms);
            if throttle.try_acquire_at("k", at).await {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn test_throttled_burst_scenario() {
        // rps=10, rpm=60, burst=20. 120 submissions at once admit 20; the
        // retried remainder admits 40 more across the minute; 60 reject.
        let throttle = Throttle::new(config(10, 60, 20));
        let start = Instant::now();

        let mut admitted_at_once = 0;
        for _ in 0..120 {
            if throttle.try_acquire_at("acme/web:build", start).await {
                admitted_at_once += 1;
            }
        }
        assert_eq!(admitted_at_once, 20);

        // Keep retrying every 100ms for the remainder of the minute window.
        let mut admitted_later = 0;
        for ms in (100..60_000u64).step_by(100) {
            let at = start + Duration::from_millis(ms);
            if throttle.try_acquire_at("acme/web:build", at).await {
                admitted_later += 1;
            }
        }
        assert_eq!(admitted_later, 40);
    }

    #[tokio::test]
    async fn test_minute_window_resets() {
        let throttle = Throttle::new(config(100, 2, 100));
        let start = Instant::now();
        assert!(throttle.try_acquire_at("k", start).await);
        assert!(throttle.try_acquire_at("k", start).await);
        assert!(!throttle.try_acquire_at("k", start).await);

        let next_window = start + Duration::from_secs(61);
        assert!(throttle.try_acquire_at("k", next_window).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let throttle = Throttle::new(config(10, 600, 1));
        let now = Instant::now();
        assert!(throttle.try_acquire_at("a:build", now).await);
        assert!(!throttle.try_acquire_at("a:build", now).await);
        // A different key still has its own burst.
        assert!(throttle.try_acquire_at("b:build", now).await);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_refill() {
        let throttle = Throttle::new(config(20, 6000, 1));
        throttle.acquire("k").await;

        let start = Instant::now();
        throttle.acquire("k").await;
        let elapsed = start.elapsed();
        // One token at 20/s arrives in ~50ms.
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_millis(500));
    }
}
