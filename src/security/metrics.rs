//! Security Metrics Collection
//!
//! Lock-free counters for the credential and token-exchange subsystem.
//!
//! ## Metrics Categories
//!
//! - **Authentication**: certificate authentication outcomes and latency
//! - **Token cache**: policy context cache hits, misses and invalidations
//! - **Token exchange**: STS/IdP round trips by outcome and latency
//! - **Issuance**: CSR signing outcomes and expiry sweeps

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Security metrics collector shared by all components
#[derive(Debug, Default)]
pub struct SecurityMetrics {
    // Authentication metrics
    auth_success_count: AtomicU64,
    auth_failure_count: AtomicU64,
    auth_latency_sum_nanos: AtomicU64,
    auth_latency_count: AtomicU64,

    // Trust store metrics
    trust_cache_hits: AtomicU64,
    trust_cache_misses: AtomicU64,

    // Policy context cache metrics
    token_cache_hits: AtomicU64,
    token_cache_misses: AtomicU64,
    token_cache_invalidations: AtomicU64,

    // Token exchange metrics
    exchange_success_count: AtomicU64,
    exchange_auth_required_count: AtomicU64,
    exchange_failure_count: AtomicU64,
    exchange_latency_sum_nanos: AtomicU64,
    exchange_latency_count: AtomicU64,
    reroute_count: AtomicU64,

    // Issuance metrics
    csr_issued_count: AtomicU64,
    csr_denied_count: AtomicU64,
    expiry_sweeps: AtomicU64,
}

impl SecurityMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    // Authentication metrics

    pub fn record_authentication_success(&self, latency: Duration) {
        self.auth_success_count.fetch_add(1, Ordering::Relaxed);
        self.auth_latency_sum_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        self.auth_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_authentication_failure(&self, _reason: &str) {
        self.auth_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    // Trust store metrics

    pub fn record_trust_cache_hit(&self) {
        self.trust_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trust_cache_miss(&self) {
        self.trust_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    // Token cache metrics

    pub fn record_token_cache_hit(&self) {
        self.token_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_cache_miss(&self) {
        self.token_cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_token_cache_invalidation(&self) {
        self.token_cache_invalidations.fetch_add(1, Ordering::Relaxed);
    }

    // Token exchange metrics

    pub fn record_exchange_success(&self, latency: Duration) {
        self.exchange_success_count.fetch_add(1, Ordering::Relaxed);
        self.record_exchange_latency(latency);
    }

    pub fn record_exchange_auth_required(&self, latency: Duration) {
        self.exchange_auth_required_count
            .fetch_add(1, Ordering::Relaxed);
        self.record_exchange_latency(latency);
    }

    pub fn record_exchange_failure(&self) {
        self.exchange_failure_count.fetch_add(1, Ordering::Relaxed);
    }

    fn record_exchange_latency(&self, latency: Duration) {
        self.exchange_latency_sum_nanos
            .fetch_add(latency.as_nanos() as u64, Ordering::Relaxed);
        self.exchange_latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reroute(&self) {
        self.reroute_count.fetch_add(1, Ordering::Relaxed);
    }

    // Issuance metrics

    pub fn record_csr_issued(&self) {
        self.csr_issued_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_csr_denied(&self) {
        self.csr_denied_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_expiry_sweep(&self) {
        self.expiry_sweeps.fetch_add(1, Ordering::Relaxed);
    }

    // Derived values

    pub fn authentication_success_rate(&self) -> f64 {
        let success = self.auth_success_count.load(Ordering::Relaxed);
        let failure = self.auth_failure_count.load(Ordering::Relaxed);
        let total = success + failure;

        if total == 0 {
            0.0
        } else {
            success as f64 / total as f64
        }
    }

    pub fn token_cache_hit_rate(&self) -> f64 {
        let hits = self.token_cache_hits.load(Ordering::Relaxed);
        let misses = self.token_cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn average_exchange_latency_nanos(&self) -> f64 {
        let sum = self.exchange_latency_sum_nanos.load(Ordering::Relaxed);
        let count = self.exchange_latency_count.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    pub fn snapshot(&self) -> SecurityMetricsSnapshot {
        SecurityMetricsSnapshot {
            auth_success_count: self.auth_success_count.load(Ordering::Relaxed),
            auth_failure_count: self.auth_failure_count.load(Ordering::Relaxed),
            trust_cache_hits: self.trust_cache_hits.load(Ordering::Relaxed),
            trust_cache_misses: self.trust_cache_misses.load(Ordering::Relaxed),
            token_cache_hits: self.token_cache_hits.load(Ordering::Relaxed),
            token_cache_misses: self.token_cache_misses.load(Ordering::Relaxed),
            token_cache_invalidations: self.token_cache_invalidations.load(Ordering::Relaxed),
            exchange_success_count: self.exchange_success_count.load(Ordering::Relaxed),
            exchange_auth_required_count: self
                .exchange_auth_required_count
                .load(Ordering::Relaxed),
            exchange_failure_count: self.exchange_failure_count.load(Ordering::Relaxed),
            average_exchange_latency_nanos: self.average_exchange_latency_nanos(),
            reroute_count: self.reroute_count.load(Ordering::Relaxed),
            csr_issued_count: self.csr_issued_count.load(Ordering::Relaxed),
            csr_denied_count: self.csr_denied_count.load(Ordering::Relaxed),
            expiry_sweeps: self.expiry_sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Serialize)]
pub struct SecurityMetricsSnapshot {
    pub auth_success_count: u64,
    pub auth_failure_count: u64,
    pub trust_cache_hits: u64,
    pub trust_cache_misses: u64,
    pub token_cache_hits: u64,
    pub token_cache_misses: u64,
    pub token_cache_invalidations: u64,
    pub exchange_success_count: u64,
    pub exchange_auth_required_count: u64,
    pub exchange_failure_count: u64,
    pub average_exchange_latency_nanos: f64,
    pub reroute_count: u64,
    pub csr_issued_count: u64,
    pub csr_denied_count: u64,
    pub expiry_sweeps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rates_with_no_samples() {
        let metrics = SecurityMetrics::new();
        assert_eq!(metrics.authentication_success_rate(), 0.0);
        assert_eq!(metrics.token_cache_hit_rate(), 0.0);
        assert_eq!(metrics.average_exchange_latency_nanos(), 0.0);
    }

    #[test]
    fn test_token_cache_hit_rate() {
        let metrics = SecurityMetrics::new();
        metrics.record_token_cache_hit();
        metrics.record_token_cache_hit();
        metrics.record_token_cache_hit();
        metrics.record_token_cache_miss();
        assert!((metrics.token_cache_hit_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exchange_latency_average_excludes_failures() {
        let metrics = SecurityMetrics::new();
        metrics.record_exchange_success(Duration::from_nanos(100));
        metrics.record_exchange_auth_required(Duration::from_nanos(300));
        metrics.record_exchange_failure();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.exchange_success_count, 1);
        assert_eq!(snapshot.exchange_auth_required_count, 1);
        assert_eq!(snapshot.exchange_failure_count, 1);
        assert!((snapshot.average_exchange_latency_nanos - 200.0).abs() < f64::EPSILON);
    }
}
