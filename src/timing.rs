use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use log::debug;
use parking_lot::Mutex;

use crate::models::ScanConfig;

/// Rolling-window latency tracker that derives the probe timeout from the
/// p95 of recent responses.
///
/// Until `min_samples` responses have been observed the configured base
/// timeout applies unchanged. After that the timeout is
/// `p95 * multiplier`, clamped to `[floor, ceiling]`, so a single slow
/// response can never park the scan and a fast LAN target tightens the
/// timeout instead of wasting the base value on every silent port.
#[derive(Debug)]
pub struct AdaptiveTimeout {
    base: Duration,
    floor: Duration,
    ceiling: Duration,
    multiplier: f64,
    window: usize,
    min_samples: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl AdaptiveTimeout {
    pub fn from_config(config: &ScanConfig) -> Self {
        AdaptiveTimeout {
            base: config.base_timeout,
            floor: config.timeout_floor,
            ceiling: config.timeout_ceiling,
            multiplier: config.timeout_multiplier,
            window: config.latency_window.max(1),
            min_samples: config.min_latency_samples.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one observed response latency. Only real responses count;
    /// timeouts are never fed back in.
    pub fn record(&self, latency: Duration) {
        let mut samples = self.samples.lock();
        samples.push_back(latency.as_secs_f64());
        while samples.len() > self.window {
            samples.pop_front();
        }
    }

    /// Timeout to apply to the next probe.
    pub fn current(&self) -> Duration {
        let samples = self.samples.lock();
        if samples.len() < self.min_samples {
            return self.base;
        }

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        drop(samples);
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let idx = ((sorted.len() as f64 * 0.95) as usize).min(sorted.len() - 1);
        let p95 = sorted[idx];
        let timeout = (p95 * self.multiplier)
            .max(self.floor.as_secs_f64())
            .min(self.ceiling.as_secs_f64());
        debug!(
            "[Timing] p95={:.4}s over {} samples, timeout={:.4}s",
            p95,
            sorted.len(),
            timeout
        );
        Duration::from_secs_f64(timeout)
    }

    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}

/// Optional probes-per-second throttle shared by all workers.
///
/// A rate of 0 disables throttling entirely; `acquire` then returns without
/// touching any limiter state.
pub struct ProbeRateLimiter {
    inner: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl ProbeRateLimiter {
    pub fn new(rate: u32) -> Self {
        let inner = NonZeroU32::new(rate).map(|r| {
            debug!("[Timing] Rate limiter active at {} probes/sec", r);
            RateLimiter::direct(Quota::per_second(r))
        });
        ProbeRateLimiter { inner }
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_some()
    }

    /// Wait until the limiter admits one more probe.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.inner {
            limiter.until_ready().await;
        }
    }
}

impl std::fmt::Debug for ProbeRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeRateLimiter")
            .field("active", &self.inner.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(base_secs: f64) -> AdaptiveTimeout {
        let config = ScanConfig {
            base_timeout: Duration::from_secs_f64(base_secs),
            ..ScanConfig::default()
        };
        AdaptiveTimeout::from_config(&config)
    }

    #[test]
    fn test_base_timeout_until_enough_samples() {
        let timing = timing(1.0);
        for _ in 0..9 {
            timing.record(Duration::from_millis(10));
        }
        // Nine samples is below the minimum of ten.
        assert_eq!(timing.current(), Duration::from_secs(1));
    }

    #[test]
    fn test_fast_target_clamps_to_floor() {
        let timing = timing(1.0);
        for _ in 0..50 {
            timing.record(Duration::from_millis(20));
        }
        // p95 of 0.02s times 1.5 is far below the 0.5s floor.
        assert_eq!(timing.current(), Duration::from_millis(500));
    }

    #[test]
    fn test_slow_target_clamps_to_ceiling() {
        let timing = timing(1.0);
        for _ in 0..20 {
            timing.record(Duration::from_secs(9));
        }
        assert_eq!(timing.current(), Duration::from_secs(10));
    }

    #[test]
    fn test_p95_tracks_slow_tail() {
        let timing = timing(1.0);
        for _ in 0..95 {
            timing.record(Duration::from_millis(50));
        }
        for _ in 0..5 {
            timing.record(Duration::from_secs(2));
        }
        // Index 95 of the sorted window lands on the slow tail.
        let current = timing.current().as_secs_f64();
        assert!((current - 3.0).abs() < 1e-6, "got {}", current);
    }

    #[test]
    fn test_window_is_bounded() {
        let timing = timing(1.0);
        for _ in 0..250 {
            timing.record(Duration::from_millis(5));
        }
        assert_eq!(timing.sample_count(), 100);
    }

    #[test]
    fn test_single_sample_window_stays_in_bounds() {
        let config = ScanConfig {
            latency_window: 1,
            min_latency_samples: 1,
            ..ScanConfig::default()
        };
        let timing = AdaptiveTimeout::from_config(&config);
        timing.record(Duration::from_secs(1));
        let current = timing.current();
        assert!(current >= config.timeout_floor);
        assert!(current <= config.timeout_ceiling);
    }

    #[tokio::test]
    async fn test_zero_rate_disables_limiter() {
        let limiter = ProbeRateLimiter::new(0);
        assert!(!limiter.is_active());
        // Must not block even when called back to back.
        for _ in 0..1000 {
            limiter.acquire().await;
        }
    }

    #[tokio::test]
    async fn test_limiter_spaces_out_probes() {
        let limiter = ProbeRateLimiter::new(10);
        assert!(limiter.is_active());
        let start = std::time::Instant::now();
        // The quota's burst capacity admits the first ten immediately; the
        // two past it must each wait for a 100ms replenishment slot.
        for _ in 0..12 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_millis(150));
    }
}
