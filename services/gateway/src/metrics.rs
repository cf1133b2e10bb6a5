use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate counters shared by every request. Relaxed ordering is enough:
/// readers only want a recent snapshot.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    requests: AtomicU64,
    forwarded: AtomicU64,
    route_not_found: AtomicU64,
    auth_rejected: AtomicU64,
    rate_limited: AtomicU64,
    upstream_unavailable: AtomicU64,
    upstream_retries: AtomicU64,
    other_errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub forwarded: u64,
    pub route_not_found: u64,
    pub auth_rejected: u64,
    pub rate_limited: u64,
    pub upstream_unavailable: u64,
    pub upstream_retries: u64,
    pub other_errors: u64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.upstream_retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a rejection by its normalized kind.
    pub fn record_rejection(&self, kind: &str) {
        let counter = match kind {
            "ROUTE_NOT_FOUND" => &self.route_not_found,
            "RATE_LIMITED" => &self.rate_limited,
            "UPSTREAM_UNAVAILABLE" => &self.upstream_unavailable,
            k if k.starts_with("AUTH_") => &self.auth_rejected,
            _ => &self.other_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            route_not_found: self.route_not_found.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            upstream_unavailable: self.upstream_unavailable.load(Ordering::Relaxed),
            upstream_retries: self.upstream_retries.load(Ordering::Relaxed),
            other_errors: self.other_errors.load(Ordering::Relaxed),
        }
    }
}
