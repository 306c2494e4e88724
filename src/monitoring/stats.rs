//! Request governance counters
//!
//! Counters only ever accumulate (until `reset`). Ratios are derived when a
//! snapshot is taken and are never stored.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Shared counter block updated by the limiter, cache path and optimizer
#[derive(Debug, Default)]
pub struct StatsAggregator {
    total_requests: AtomicU64,
    accepted_requests: AtomicU64,
    rejected_requests: AtomicU64,
    batched_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    cache_hits: AtomicU64,
    backoff_count: AtomicU64,
    // Wait time in microseconds, no atomic f64
    total_wait_us: AtomicU64,
    wait_samples: AtomicU64,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_accepted(&self, waited: Duration) {
        self.accepted_requests.fetch_add(1, Ordering::Relaxed);
        self.total_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
        self.wait_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batched(&self, count: u64) {
        self.batched_requests.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_deduplicated(&self, count: u64) {
        self.deduplicated_requests
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backoff(&self) {
        self.backoff_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        let wait_samples = self.wait_samples.load(Ordering::Relaxed);
        let total_wait_us = self.total_wait_us.load(Ordering::Relaxed);

        Stats {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            accepted_requests: self.accepted_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
            batched_requests: self.batched_requests.load(Ordering::Relaxed),
            deduplicated_requests: self.deduplicated_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            backoff_count: self.backoff_count.load(Ordering::Relaxed),
            average_wait_time_ms: if wait_samples > 0 {
                total_wait_us as f64 / wait_samples as f64 / 1000.0
            } else {
                0.0
            },
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.accepted_requests,
            &self.rejected_requests,
            &self.batched_requests,
            &self.deduplicated_requests,
            &self.cache_hits,
            &self.backoff_count,
            &self.total_wait_us,
            &self.wait_samples,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub total_requests: u64,
    pub accepted_requests: u64,
    pub rejected_requests: u64,
    pub batched_requests: u64,
    pub deduplicated_requests: u64,
    pub cache_hits: u64,
    pub backoff_count: u64,
    pub average_wait_time_ms: f64,
}

impl Stats {
    /// accepted / (accepted + rejected), 0.0 before any request settles
    pub fn success_rate(&self) -> f64 {
        let settled = self.accepted_requests + self.rejected_requests;
        if settled > 0 {
            self.accepted_requests as f64 / settled as f64
        } else {
            0.0
        }
    }

    /// Share of logical requests that did not need their own network call
    pub fn api_call_reduction(&self) -> f64 {
        if self.total_requests > 0 {
            (self.batched_requests + self.deduplicated_requests + self.cache_hits) as f64
                / self.total_requests as f64
        } else {
            0.0
        }
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.cache_hits as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }

    pub fn deduplication_rate(&self) -> f64 {
        if self.total_requests > 0 {
            self.deduplicated_requests as f64 / self.total_requests as f64
        } else {
            0.0
        }
    }
}

/// `Stats` plus its derived ratios, for JSON output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub stats: Stats,
    pub success_rate: f64,
    pub api_call_reduction: f64,
    pub cache_hit_rate: f64,
    pub deduplication_rate: f64,
}

impl From<Stats> for StatsReport {
    fn from(stats: Stats) -> Self {
        Self {
            success_rate: stats.success_rate(),
            api_call_reduction: stats.api_call_reduction(),
            cache_hit_rate: stats.cache_hit_rate(),
            deduplication_rate: stats.deduplication_rate(),
            stats,
        }
    }
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "requests: {} total, {} accepted, {} rejected | success {:.1}% | dedup {} | batched {} | cache hits {} | backoffs {} | avg wait {:.1}ms | reduction {:.1}%",
            self.total_requests,
            self.accepted_requests,
            self.rejected_requests,
            self.success_rate() * 100.0,
            self.deduplicated_requests,
            self.batched_requests,
            self.cache_hits,
            self.backoff_count,
            self.average_wait_time_ms,
            self.api_call_reduction() * 100.0
        )
    }
}
