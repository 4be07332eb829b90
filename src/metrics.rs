//! Per-module call metrics.
//!
//! Tracks call latency, outcomes, in-flight depth and connection attempts.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Point-in-time snapshot of all metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // Counters
    pub calls_total: usize,
    pub calls_success: usize,
    pub calls_failed: usize,

    // Latency (milliseconds)
    pub latency_avg_ms: f64,
    pub latency_p50_ms: f64,
    pub latency_p95_ms: f64,
    pub latency_min_ms: f64,
    pub latency_max_ms: f64,

    // In-flight calls
    pub in_flight: usize,
    pub max_in_flight: usize,

    // Connection
    pub connect_attempts: usize,
}

/// Thread-safe metrics collector, shared by a module and its I/O tasks.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Mutex<MetricsInner>>,
}

struct MetricsInner {
    max_latency_samples: usize,

    calls_total: usize,
    calls_success: usize,
    calls_failed: usize,

    in_flight: usize,
    max_in_flight: usize,

    connect_attempts: usize,

    // Circular buffer
    latencies: VecDeque<f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::with_capacity(1000)
    }

    pub fn with_capacity(max_latency_samples: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsInner {
                max_latency_samples,
                calls_total: 0,
                calls_success: 0,
                calls_failed: 0,
                in_flight: 0,
                max_in_flight: 0,
                connect_attempts: 0,
                latencies: VecDeque::with_capacity(max_latency_samples),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a call. Returns the start instant for [`Metrics::end_call`].
    pub fn start_call(&self) -> Instant {
        let mut inner = self.lock();
        inner.calls_total += 1;
        inner.in_flight += 1;
        inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        Instant::now()
    }

    /// End tracking a call. Returns latency in milliseconds.
    pub fn end_call(&self, start: Instant, success: bool) -> f64 {
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut inner = self.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
        if success {
            inner.calls_success += 1;
        } else {
            inner.calls_failed += 1;
        }

        inner.latencies.push_back(latency_ms);
        if inner.latencies.len() > inner.max_latency_samples {
            inner.latencies.pop_front();
        }

        latency_ms
    }

    pub fn record_connect_attempt(&self) {
        self.lock().connect_attempts += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();

        let mut latencies: Vec<f64> = inner.latencies.iter().copied().collect();
        latencies.sort_by(f64::total_cmp);
        let (avg, p50, p95, min, max) = match latencies.len() {
            0 => (0.0, 0.0, 0.0, 0.0, 0.0),
            n => (
                latencies.iter().sum::<f64>() / n as f64,
                latencies[((n as f64 * 0.50) as usize).min(n - 1)],
                latencies[((n as f64 * 0.95) as usize).min(n - 1)],
                latencies[0],
                latencies[n - 1],
            ),
        };

        MetricsSnapshot {
            calls_total: inner.calls_total,
            calls_success: inner.calls_success,
            calls_failed: inner.calls_failed,
            latency_avg_ms: avg,
            latency_p50_ms: p50,
            latency_p95_ms: p95,
            latency_min_ms: min,
            latency_max_ms: max,
            in_flight: inner.in_flight,
            max_in_flight: inner.max_in_flight,
            connect_attempts: inner.connect_attempts,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_and_in_flight() {
        let metrics = Metrics::new();
        let a = metrics.start_call();
        let b = metrics.start_call();
        assert_eq!(metrics.snapshot().in_flight, 2);

        metrics.end_call(a, true);
        metrics.end_call(b, false);

        let snap = metrics.snapshot();
        assert_eq!(snap.calls_total, 2);
        assert_eq!(snap.calls_success, 1);
        assert_eq!(snap.calls_failed, 1);
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.max_in_flight, 2);
        assert!(snap.latency_max_ms >= snap.latency_min_ms);
    }

    #[test]
    fn test_latency_buffer_is_bounded() {
        let metrics = Metrics::with_capacity(3);
        for _ in 0..10 {
            let start = metrics.start_call();
            metrics.end_call(start, true);
        }
        assert_eq!(metrics.lock().latencies.len(), 3);
        assert_eq!(metrics.snapshot().calls_total, 10);
    }

    #[test]
    fn test_empty_snapshot() {
        let snap = Metrics::new().snapshot();
        assert_eq!(snap.calls_total, 0);
        assert_eq!(snap.latency_avg_ms, 0.0);
        assert_eq!(snap.connect_attempts, 0);
    }
}
