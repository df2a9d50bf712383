// Copyright (c) 2024-2026 IdleHands Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Client-side backpressure: a rolling window of retryable errors drives a
//! growing pre-request delay, and a response-time monitor flags degraded
//! endpoints.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rolling window length for retryable-error accounting.
const WINDOW: Duration = Duration::from_secs(60);
/// Hits within the window before delays kick in.
const THRESHOLD: usize = 3;
/// Delay ceiling.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Tracks recent retryable errors and computes the delay to apply before
/// the next request: `2^level · 1s`, where level grows with each hit past
/// the threshold.
#[derive(Default)]
pub struct RateLimiter {
    hits: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retryable error (429/503/5xx/connect failure).
    pub fn record(&self) {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.push_back(Instant::now());
    }

    /// Delay to apply before the next request, if any.
    pub fn current_delay(&self) -> Option<Duration> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = Instant::now() - WINDOW;
        while hits.front().is_some_and(|t| *t < cutoff) {
            hits.pop_front();
        }
        let count = hits.len();
        if count < THRESHOLD {
            return None;
        }
        let level = (count - THRESHOLD + 1).min(6) as u32;
        Some(Duration::from_secs(1 << level).min(MAX_DELAY))
    }

    /// Sleep out the current delay, if one applies.
    pub async fn throttle(&self) {
        if let Some(delay) = self.current_delay() {
            tracing::debug!(?delay, "rate limiter throttling next request");
            tokio::time::sleep(delay).await;
        }
    }
}

/// Rolling average of response times; flags responses that take much longer
/// than the recent norm so embedders can warn the user.
pub struct BackpressureMonitor {
    samples: Mutex<VecDeque<Duration>>,
    capacity: usize,
}

impl Default for BackpressureMonitor {
    fn default() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            capacity: 32,
        }
    }
}

impl BackpressureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, elapsed: Duration) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(elapsed);
    }

    pub fn average(&self) -> Option<Duration> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.is_empty() {
            return None;
        }
        let total: Duration = samples.iter().sum();
        Some(total / samples.len() as u32)
    }

    /// True when `current` exceeds `k` times the rolling average.
    /// Requires a few samples before it will ever fire.
    pub fn is_degraded(&self, current: Duration, k: f32) -> bool {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        if samples.len() < 4 {
            return false;
        }
        let total: Duration = samples.iter().sum();
        let avg = total.as_secs_f32() / samples.len() as f32;
        current.as_secs_f32() > k * avg
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_delay_below_threshold() {
        let rl = RateLimiter::new();
        rl.record();
        rl.record();
        assert!(rl.current_delay().is_none());
    }

    #[test]
    fn delay_grows_with_hits() {
        let rl = RateLimiter::new();
        for _ in 0..THRESHOLD {
            rl.record();
        }
        let d1 = rl.current_delay().unwrap();
        rl.record();
        let d2 = rl.current_delay().unwrap();
        assert!(d2 > d1, "{d2:?} should exceed {d1:?}");
    }

    #[test]
    fn delay_is_capped() {
        let rl = RateLimiter::new();
        for _ in 0..50 {
            rl.record();
        }
        assert!(rl.current_delay().unwrap() <= MAX_DELAY);
    }

    #[test]
    fn monitor_average_of_observed_samples() {
        let m = BackpressureMonitor::new();
        m.observe(Duration::from_millis(100));
        m.observe(Duration::from_millis(300));
        let avg = m.average().unwrap();
        assert_eq!(avg, Duration::from_millis(200));
    }

    #[test]
    fn monitor_needs_samples_before_degraded() {
        let m = BackpressureMonitor::new();
        m.observe(Duration::from_millis(100));
        assert!(!m.is_degraded(Duration::from_secs(100), 2.0));
    }

    #[test]
    fn monitor_flags_slow_response() {
        let m = BackpressureMonitor::new();
        for _ in 0..8 {
            m.observe(Duration::from_millis(100));
        }
        assert!(m.is_degraded(Duration::from_millis(500), 2.0));
        assert!(!m.is_degraded(Duration::from_millis(150), 2.0));
    }
}
