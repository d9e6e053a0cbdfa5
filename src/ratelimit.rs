//! Per-host rate-limit / throttle coordination (spec §4.4).
//!
//! One `ThrottleTracker` per server host, shared across all accounts that
//! happen to point at the same host, so concurrent accounts on one provider
//! don't collectively exceed what a single account's preset allows.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::constants::SUCCESS_DECAY_FACTOR;

struct ThrottleTracker {
    base_ms: u64,
    max_ms: u64,
    multiplier: f64,
    current_ms: u64,
    last_request: Option<Instant>,
}

impl ThrottleTracker {
    fn new(base_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        Self {
            base_ms,
            max_ms,
            multiplier,
            current_ms: base_ms,
            last_request: None,
        }
    }

    fn delay_remaining(&self) -> Duration {
        match self.last_request {
            Some(last) => {
                let elapsed = last.elapsed();
                let target = Duration::from_millis(self.current_ms);
                target.saturating_sub(elapsed)
            }
            None => Duration::ZERO,
        }
    }

    fn mark_sent(&mut self) {
        self.last_request = Some(Instant::now());
    }

    fn record_throttle(&mut self) {
        let scaled = (self.current_ms as f64 * self.multiplier).round() as u64;
        self.current_ms = scaled.min(self.max_ms);
    }

    fn record_success(&mut self) {
        let decayed = (self.current_ms as f64 * SUCCESS_DECAY_FACTOR).round() as u64;
        self.current_ms = decayed.max(self.base_ms);
    }
}

/// Case-insensitive substrings that identify a `NO`/`BAD` response as a
/// throttle rather than a genuine failure.
const THROTTLE_MARKERS: &[&str] = &[
    "try again later",
    "rate limit",
    "too many",
    "throttl",
    "temporary",
    "overquota",
    "max connections",
];

pub fn is_throttle_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    THROTTLE_MARKERS.iter().any(|m| lower.contains(m))
}

pub struct RateLimitCoordinator {
    trackers: Mutex<HashMap<String, ThrottleTracker>>,
}

impl Default for RateLimitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitCoordinator {
    pub fn new() -> Self {
        Self {
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Block until the next request to `host` is allowed under its current
    /// delay, creating a tracker seeded from `(base_ms, max_ms, multiplier)`
    /// on first use.
    pub async fn wait(&self, host: &str, params: (u64, u64, f64)) {
        let wait_for = {
            let mut guard = self.trackers.lock().await;
            let tracker = guard
                .entry(host.to_lowercase())
                .or_insert_with(|| ThrottleTracker::new(params.0, params.1, params.2));
            let remaining = tracker.delay_remaining();
            tracker.mark_sent();
            remaining
        };
        if !wait_for.is_zero() {
            sleep(wait_for).await;
        }
    }

    pub async fn record_throttle(&self, host: &str) {
        let mut guard = self.trackers.lock().await;
        if let Some(tracker) = guard.get_mut(&host.to_lowercase()) {
            tracker.record_throttle();
        }
    }

    pub async fn record_success(&self, host: &str) {
        let mut guard = self.trackers.lock().await;
        if let Some(tracker) = guard.get_mut(&host.to_lowercase()) {
            tracker.record_success();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_text_matches_common_provider_phrasing() {
        assert!(is_throttle_text("[ALERT] Too many simultaneous connections"));
        assert!(is_throttle_text("Please try again later."));
        assert!(!is_throttle_text("Invalid credentials"));
    }

    #[tokio::test]
    async fn record_throttle_increases_delay_monotonically() {
        let coordinator = RateLimitCoordinator::new();
        let params = (10u64, 1000u64, 2.0f64);
        coordinator.wait("host", params).await;
        let before = {
            let guard = coordinator.trackers.lock().await;
            guard["host"].current_ms
        };
        coordinator.record_throttle("host").await;
        let guard = coordinator.trackers.lock().await;
        let tracker = &guard["host"];
        assert!(tracker.current_ms >= before);
        assert!(tracker.current_ms <= tracker.max_ms);
    }

    #[tokio::test]
    async fn record_success_decays_toward_base() {
        let coordinator = RateLimitCoordinator::new();
        coordinator.wait("host", (10, 1000, 2.0)).await;
        {
            let mut guard = coordinator.trackers.lock().await;
            let tracker = guard.get_mut("host").unwrap();
            tracker.current_ms = 800;
        }
        coordinator.record_success("host").await;
        let guard = coordinator.trackers.lock().await;
        let tracker = &guard["host"];
        assert!(tracker.current_ms < 800);
        assert!(tracker.current_ms >= tracker.base_ms);
    }
}
