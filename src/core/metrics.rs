use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub requests_enqueued: u64,
    pub dedup_hits: u64,
    pub dispatches: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub timeouts: u64,
    pub network_errors: u64,
    pub http_status_errors: u64,
    pub relogins_triggered: u64,
    pub relogins_coalesced: u64,
    pub replays: u64,
    pub in_flight: u64,
    /// Registry entries not yet removed, filled in by the client.
    pub pending_entries: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub status_counts: BTreeMap<u16, u64>,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct Metrics {
    inner: Option<Arc<MetricsInner>>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    requests_enqueued: AtomicU64,
    dedup_hits: AtomicU64,
    dispatches: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_failed: AtomicU64,
    timeouts: AtomicU64,
    network_errors: AtomicU64,
    http_status_errors: AtomicU64,
    relogins_triggered: AtomicU64,
    relogins_coalesced: AtomicU64,
    replays: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    inner: Option<Arc<MetricsInner>>,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            if let Some(inner) = &self.inner {
                inner.$field.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
}

impl Metrics {
    pub(crate) fn enabled() -> Self {
        Self {
            inner: Some(Arc::new(MetricsInner::default())),
        }
    }

    pub(crate) fn disabled() -> Self {
        Self::default()
    }

    counter!(record_enqueued, requests_enqueued);
    counter!(record_dedup_hit, dedup_hits);
    counter!(record_relogin_triggered, relogins_triggered);
    counter!(record_relogin_coalesced, relogins_coalesced);
    counter!(record_replay, replays);

    pub(crate) fn enter_in_flight(&self) -> InFlightGuard {
        match &self.inner {
            Some(inner) => {
                inner.dispatches.fetch_add(1, Ordering::Relaxed);
                inner.in_flight.fetch_add(1, Ordering::Relaxed);
                InFlightGuard {
                    inner: Some(Arc::clone(inner)),
                }
            }
            None => InFlightGuard { inner: None },
        }
    }

    pub(crate) fn record_completed(&self, result: &Result<Response, Error>, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        self.record_latency(latency);

        let error = match result {
            Ok(response) => {
                inner.requests_succeeded.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(response.status().as_u16());
                return;
            }
            Err(error) => error,
        };

        inner.requests_failed.fetch_add(1, Ordering::Relaxed);
        match error {
            Error::Timeout { .. } => {
                inner.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Error::Network { kind, .. } => {
                inner.network_errors.fetch_add(1, Ordering::Relaxed);
                self.add_error_count(format!("network:{kind}"));
                return;
            }
            Error::HttpStatus { status, .. } => {
                inner.http_status_errors.fetch_add(1, Ordering::Relaxed);
                self.add_status_count(*status);
                self.add_error_count(format!("http_status:{status}"));
                return;
            }
            _ => {}
        }
        self.add_error_count(error.code().as_str().to_owned());
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        let Some(inner) = &self.inner else {
            return MetricsSnapshot::default();
        };

        let latency_samples = inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            requests_enqueued: inner.requests_enqueued.load(Ordering::Relaxed),
            dedup_hits: inner.dedup_hits.load(Ordering::Relaxed),
            dispatches: inner.dispatches.load(Ordering::Relaxed),
            requests_succeeded: inner.requests_succeeded.load(Ordering::Relaxed),
            requests_failed: inner.requests_failed.load(Ordering::Relaxed),
            timeouts: inner.timeouts.load(Ordering::Relaxed),
            network_errors: inner.network_errors.load(Ordering::Relaxed),
            http_status_errors: inner.http_status_errors.load(Ordering::Relaxed),
            relogins_triggered: inner.relogins_triggered.load(Ordering::Relaxed),
            relogins_coalesced: inner.relogins_coalesced.load(Ordering::Relaxed),
            replays: inner.replays.load(Ordering::Relaxed),
            in_flight: inner.in_flight.load(Ordering::Relaxed),
            pending_entries: 0,
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            status_counts: lock_unpoisoned(&inner.status_counts).clone(),
            error_counts: lock_unpoisoned(&inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        let Some(inner) = &self.inner else {
            return;
        };
        inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }

    fn add_status_count(&self, status: u16) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut status_counts = lock_unpoisoned(&inner.status_counts);
        *status_counts.entry(status).or_insert(0) += 1;
    }

    fn add_error_count(&self, error_key: String) {
        let Some(inner) = &self.inner else {
            return;
        };
        let mut error_counts = lock_unpoisoned(&inner.error_counts);
        *error_counts.entry(error_key).or_insert(0) += 1;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(inner) = &self.inner {
            inner.in_flight.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
