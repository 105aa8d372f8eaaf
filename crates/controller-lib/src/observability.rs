//! Observability infrastructure for the outbox
//!
//! Provides:
//! - Prometheus collectors for storage failures, remote-write delivery and retention
//! - Registration on a caller-owned `prometheus::Registry` (no process-global state)

use prometheus::{
    exponential_buckets, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::Duration;

/// Latency buckets for remote-write requests (in seconds)
const REQUEST_DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Status label for attempts that never got a response
pub const NO_RESPONSE: &str = "no_response";

struct OutboxMetricsInner {
    storage_write_failures: IntCounterVec,
    timeseries_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    response_codes_total: IntCounterVec,
    payload_size_bytes: HistogramVec,
    failures_total: IntCounterVec,
    backlog_records: IntGaugeVec,
    records_processed_total: IntCounterVec,
    db_failures_total: IntCounterVec,
    housekeeper_deleted_total: IntCounter,
    housekeeper_failures_total: IntCounter,
}

/// Outbox metrics for Prometheus exposition
///
/// Cheap to clone; clones share the same collectors.
#[derive(Clone)]
pub struct OutboxMetrics {
    inner: Arc<OutboxMetricsInner>,
}

impl OutboxMetrics {
    /// Create all collectors and register them on `registry`.
    ///
    /// Fails if the registry already holds collectors with the same names.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let storage_write_failures = IntCounterVec::new(
            Opts::new(
                "storage_write_failure_total",
                "Total number of failed resource record writes",
            ),
            &["resource_type", "namespace", "action"],
        )?;
        let timeseries_total = IntCounterVec::new(
            Opts::new(
                "remote_write_timeseries_total",
                "Total number of time series sent to the remote endpoint",
            ),
            &["endpoint"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "remote_write_request_duration_seconds",
                "Duration of remote write requests",
            )
            .buckets(REQUEST_DURATION_BUCKETS.to_vec()),
            &["endpoint"],
        )?;
        let response_codes_total = IntCounterVec::new(
            Opts::new(
                "remote_write_response_codes_total",
                "Remote write responses by status code",
            ),
            &["endpoint", "status_code"],
        )?;
        let payload_size_bytes = HistogramVec::new(
            HistogramOpts::new(
                "remote_write_payload_size_bytes",
                "Compressed size of remote write payloads",
            )
            .buckets(exponential_buckets(256.0, 2.0, 10)?),
            &["endpoint"],
        )?;
        let failures_total = IntCounterVec::new(
            Opts::new(
                "remote_write_failures_total",
                "Total number of failed remote write flushes",
            ),
            &["endpoint"],
        )?;
        let backlog_records = IntGaugeVec::new(
            Opts::new(
                "remote_write_backlog_records",
                "Records selected for delivery and not yet sent",
            ),
            &["endpoint"],
        )?;
        let records_processed_total = IntCounterVec::new(
            Opts::new(
                "remote_write_records_processed_total",
                "Total number of records confirmed delivered",
            ),
            &["endpoint"],
        )?;
        let db_failures_total = IntCounterVec::new(
            Opts::new(
                "remote_write_db_failures_total",
                "Store failures while selecting or acknowledging records",
            ),
            &["endpoint"],
        )?;
        let housekeeper_deleted_total = IntCounter::new(
            "housekeeper_records_deleted_total",
            "Total number of delivered records reclaimed by retention",
        )?;
        let housekeeper_failures_total = IntCounter::new(
            "housekeeper_failures_total",
            "Total number of failed retention passes",
        )?;

        registry.register(Box::new(storage_write_failures.clone()))?;
        registry.register(Box::new(timeseries_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(response_codes_total.clone()))?;
        registry.register(Box::new(payload_size_bytes.clone()))?;
        registry.register(Box::new(failures_total.clone()))?;
        registry.register(Box::new(backlog_records.clone()))?;
        registry.register(Box::new(records_processed_total.clone()))?;
        registry.register(Box::new(db_failures_total.clone()))?;
        registry.register(Box::new(housekeeper_deleted_total.clone()))?;
        registry.register(Box::new(housekeeper_failures_total.clone()))?;

        Ok(Self {
            inner: Arc::new(OutboxMetricsInner {
                storage_write_failures,
                timeseries_total,
                request_duration_seconds,
                response_codes_total,
                payload_size_bytes,
                failures_total,
                backlog_records,
                records_processed_total,
                db_failures_total,
                housekeeper_deleted_total,
                housekeeper_failures_total,
            }),
        })
    }

    /// Count a failed store write
    pub fn inc_storage_write_failure(&self, resource_type: &str, namespace: &str, action: &str) {
        self.inner
            .storage_write_failures
            .with_label_values(&[resource_type, namespace, action])
            .inc();
    }

    pub fn storage_write_failures(&self, resource_type: &str, namespace: &str, action: &str) -> u64 {
        self.inner
            .storage_write_failures
            .with_label_values(&[resource_type, namespace, action])
            .get()
    }

    /// Record one remote-write attempt
    pub fn observe_request(&self, endpoint: &str, status_code: &str, elapsed: Duration) {
        self.inner
            .request_duration_seconds
            .with_label_values(&[endpoint])
            .observe(elapsed.as_secs_f64());
        self.inner
            .response_codes_total
            .with_label_values(&[endpoint, status_code])
            .inc();
    }

    pub fn response_codes(&self, endpoint: &str, status_code: &str) -> u64 {
        self.inner
            .response_codes_total
            .with_label_values(&[endpoint, status_code])
            .get()
    }

    /// Record a delivered batch
    pub fn observe_batch(&self, endpoint: &str, series: usize, payload_bytes: usize) {
        self.inner
            .timeseries_total
            .with_label_values(&[endpoint])
            .inc_by(series as u64);
        self.inner
            .payload_size_bytes
            .with_label_values(&[endpoint])
            .observe(payload_bytes as f64);
    }

    pub fn timeseries_sent(&self, endpoint: &str) -> u64 {
        self.inner.timeseries_total.with_label_values(&[endpoint]).get()
    }

    pub fn inc_push_failure(&self, endpoint: &str) {
        self.inner.failures_total.with_label_values(&[endpoint]).inc();
    }

    pub fn push_failures(&self, endpoint: &str) -> u64 {
        self.inner.failures_total.with_label_values(&[endpoint]).get()
    }

    pub fn set_backlog(&self, endpoint: &str, records: usize) {
        self.inner
            .backlog_records
            .with_label_values(&[endpoint])
            .set(records as i64);
    }

    pub fn backlog(&self, endpoint: &str) -> i64 {
        self.inner.backlog_records.with_label_values(&[endpoint]).get()
    }

    pub fn inc_records_processed(&self, endpoint: &str, records: usize) {
        self.inner
            .records_processed_total
            .with_label_values(&[endpoint])
            .inc_by(records as u64);
    }

    pub fn records_processed(&self, endpoint: &str) -> u64 {
        self.inner
            .records_processed_total
            .with_label_values(&[endpoint])
            .get()
    }

    pub fn inc_db_failure(&self, endpoint: &str) {
        self.inner.db_failures_total.with_label_values(&[endpoint]).inc();
    }

    pub fn db_failures(&self, endpoint: &str) -> u64 {
        self.inner.db_failures_total.with_label_values(&[endpoint]).get()
    }

    pub fn inc_records_reclaimed(&self, records: usize) {
        self.inner.housekeeper_deleted_total.inc_by(records as u64);
    }

    pub fn records_reclaimed(&self) -> u64 {
        self.inner.housekeeper_deleted_total.get()
    }

    pub fn inc_housekeeper_failure(&self) {
        self.inner.housekeeper_failures_total.inc();
    }

    pub fn housekeeper_failures(&self) -> u64 {
        self.inner.housekeeper_failures_total.get()
    }
}
