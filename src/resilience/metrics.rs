use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Running counters for one service.
///
/// Lock-free; every counter is an independent atomic, so a snapshot taken
/// while calls are in flight may be off by the calls currently completing.
#[derive(Debug, Default)]
pub struct ResilienceMetrics {
    total_requests: AtomicU64,
    successful_requests: AtomicU64,
    failed_requests: AtomicU64,
    response_time_micros: AtomicU64,
    circuit_breaker_trips: AtomicU64,
    rate_limit_hits: AtomicU64,
    retry_attempts: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Mean attempt duration in milliseconds.
    pub average_response_time_ms: f64,
    pub circuit_breaker_trips: u64,
    pub rate_limit_hits: u64,
    pub retry_attempts: u64,
}

impl ResilienceMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, elapsed: Duration) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.response_time_micros.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.record(elapsed);
        self.successful_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.record(elapsed);
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trip(&self) {
        self.circuit_breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.successful_requests,
            &self.failed_requests,
            &self.response_time_micros,
            &self.circuit_breaker_trips,
            &self.rate_limit_hits,
            &self.retry_attempts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.total_requests.load(Ordering::Relaxed);
        let micros = self.response_time_micros.load(Ordering::Relaxed);
        let average_response_time_ms = if total == 0 {
            0.0
        } else {
            micros as f64 / total as f64 / 1000.0
        };
        MetricsSnapshot {
            total_requests: total,
            successful_requests: self.successful_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            average_response_time_ms,
            circuit_breaker_trips: self.circuit_breaker_trips.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            retry_attempts: self.retry_attempts.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Fraction of attempts that succeeded, `1.0` when nothing ran.
    pub fn success_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}
