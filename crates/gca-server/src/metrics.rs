//! Structured counters, served by the `/metrics` HTTP endpoint — the
//! same shape as the ingest server's `Metrics`/`MResp` pair, just with
//! this protocol's counters instead of seismic-ingest ones.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub struct Metrics {
    pub reports_stored: AtomicU64,
    pub reports_idempotent: AtomicU64,
    pub reports_banned: AtomicU64,
    pub reports_dropped: AtomicU64,
    pub auths_accepted: AtomicU64,
    pub auths_banned: AtomicU64,
    pub auths_rejected: AtomicU64,
    pub tcp_syncs: AtomicU64,
    pub http_requests: AtomicU64,
    pub rotations: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            reports_stored: AtomicU64::new(0),
            reports_idempotent: AtomicU64::new(0),
            reports_banned: AtomicU64::new(0),
            reports_dropped: AtomicU64::new(0),
            auths_accepted: AtomicU64::new(0),
            auths_banned: AtomicU64::new(0),
            auths_rejected: AtomicU64::new(0),
            tcp_syncs: AtomicU64::new(0),
            http_requests: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reports_stored: self.reports_stored.load(Ordering::Relaxed),
            reports_idempotent: self.reports_idempotent.load(Ordering::Relaxed),
            reports_banned: self.reports_banned.load(Ordering::Relaxed),
            reports_dropped: self.reports_dropped.load(Ordering::Relaxed),
            auths_accepted: self.auths_accepted.load(Ordering::Relaxed),
            auths_banned: self.auths_banned.load(Ordering::Relaxed),
            auths_rejected: self.auths_rejected.load(Ordering::Relaxed),
            tcp_syncs: self.tcp_syncs.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            rotations: self.rotations.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    reports_stored: u64,
    reports_idempotent: u64,
    reports_banned: u64,
    reports_dropped: u64,
    auths_accepted: u64,
    auths_banned: u64,
    auths_rejected: u64,
    tcp_syncs: u64,
    http_requests: u64,
    rotations: u64,
}
