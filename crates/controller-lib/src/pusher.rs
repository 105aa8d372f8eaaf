//! Outbox delivery pump
//!
//! On every tick the pusher:
//! - Selects records pending delivery, in insertion order
//! - Packs them greedily into batches under a byte budget
//! - Encodes each batch as a remote-write request and POSTs it, with retries
//! - Marks every delivered record as sent in one transaction
//!
//! Delivery is at-least-once: a record whose acknowledgement fails to persist
//! is simply selected and sent again on the next tick.

use crate::error::PushError;
use crate::health::{components, HealthRegistry};
use crate::models::ResourceRecord;
use crate::observability::OutboxMetrics;
use crate::remote_write::{self, RemoteWriteClient, RetryPolicy};
use crate::secrets::ApiKeyProvider;
use crate::store::{RecordQuery, ResourceStore};
use crate::task::{PeriodicJob, Shutdown};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use url::Url;

/// Configuration for the delivery pump
#[derive(Debug, Clone)]
pub struct PusherConfig {
    /// Full remote-write URL, query string included
    pub endpoint: Url,
    pub send_interval: Duration,
    /// Bound on each individual POST
    pub send_timeout: Duration,
    /// Byte budget per POST, measured on record sizes
    pub max_bytes_per_send: usize,
    /// Total attempts per batch
    pub max_retries: u32,
    /// First component of every series name
    pub metric_prefix: String,
    pub backoff_base: Duration,
    pub max_jitter: Duration,
}

impl PusherConfig {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            send_interval: Duration::from_secs(60),
            send_timeout: Duration::from_secs(10),
            max_bytes_per_send: 500_000,
            max_retries: 3,
            metric_prefix: "cloudzero".to_string(),
            backoff_base: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries,
            backoff_base: self.backoff_base,
            max_jitter: self.max_jitter,
        }
    }
}

/// What one flush did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records pending when the flush started
    pub selected: usize,
    /// Records confirmed delivered
    pub delivered: usize,
    /// Successful POSTs
    pub batches: usize,
    /// Time series in those POSTs
    pub series: usize,
}

/// Split `records` into consecutive batches whose summed `size` stays within
/// `max_bytes`. A record larger than the budget travels alone.
pub fn pack_batches(records: Vec<ResourceRecord>, max_bytes: usize) -> Vec<Vec<ResourceRecord>> {
    let mut batches = Vec::new();
    let mut current: Vec<ResourceRecord> = Vec::new();
    let mut current_bytes = 0usize;

    for record in records {
        if !current.is_empty() && current_bytes + record.size > max_bytes {
            batches.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += record.size;
        current.push(record);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Periodic remote-write delivery of pending records
pub struct MetricsPusher {
    store: ResourceStore,
    client: RemoteWriteClient,
    api_key: Arc<dyn ApiKeyProvider>,
    config: PusherConfig,
    metrics: OutboxMetrics,
    health: HealthRegistry,
    flush_lock: Mutex<()>,
}

impl MetricsPusher {
    pub fn new(
        store: ResourceStore,
        api_key: Arc<dyn ApiKeyProvider>,
        config: PusherConfig,
        health: HealthRegistry,
    ) -> Result<Self, PushError> {
        let metrics = store.metrics().clone();
        let client = RemoteWriteClient::new(config.endpoint.clone(), metrics.clone())?;
        Ok(Self {
            store,
            client,
            api_key,
            config,
            metrics,
            health,
            flush_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PusherConfig {
        &self.config
    }

    /// Deliver everything currently pending.
    ///
    /// If a batch exhausts its retries the flush stops there and returns the
    /// error; batches delivered before it are still marked sent.
    pub async fn flush(&self, shutdown: &Shutdown) -> Result<FlushReport, PushError> {
        let _guard = self.flush_lock.lock().await;
        let endpoint = self.client.endpoint_label().to_string();
        let now = self.store.clock().now();

        let pending = match self.store.find_all_by(RecordQuery::PendingDelivery).await {
            Ok(pending) => pending,
            Err(e) => {
                self.metrics.inc_db_failure(&endpoint);
                error!(error = %e, "Failed to select records pending delivery");
                return Err(e.into());
            }
        };

        let mut report = FlushReport {
            selected: pending.len(),
            ..Default::default()
        };
        self.metrics.set_backlog(&endpoint, report.selected);
        if pending.is_empty() {
            debug!("No records pending delivery");
            return Ok(report);
        }

        let api_key = self.api_key.api_key();
        if api_key.is_empty() {
            self.metrics.inc_push_failure(&endpoint);
            return Err(PushError::MissingApiKey);
        }

        let policy = self.config.retry_policy();
        let mut delivered: Vec<String> = Vec::with_capacity(pending.len());
        let mut failure = None;

        for batch in pack_batches(pending, self.config.max_bytes_per_send) {
            match self.send_batch(&batch, &api_key, &policy, shutdown).await {
                Ok(series) => {
                    delivered.extend(batch.into_iter().map(|record| record.id));
                    report.batches += 1;
                    report.series += series;
                    self.metrics
                        .set_backlog(&endpoint, report.selected - delivered.len());
                }
                Err(e) => {
                    self.metrics.inc_push_failure(&endpoint);
                    error!(
                        batch_records = batch.len(),
                        delivered = delivered.len(),
                        error = %e,
                        "Failed to deliver batch, aborting flush"
                    );
                    failure = Some(e);
                    break;
                }
            }
        }

        report.delivered = delivered.len();
        if !delivered.is_empty() {
            self.metrics.inc_records_processed(&endpoint, delivered.len());
            // not retried: unmarked records are re-selected next tick
            if let Err(e) = self.store.mark_sent(delivered, now).await {
                self.metrics.inc_db_failure(&endpoint);
                error!(error = %e, "Failed to mark delivered records as sent");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!(
                    records = report.delivered,
                    batches = report.batches,
                    series = report.series,
                    "Flushed pending records"
                );
                Ok(report)
            }
        }
    }

    async fn send_batch(
        &self,
        batch: &[ResourceRecord],
        api_key: &str,
        policy: &RetryPolicy,
        shutdown: &Shutdown,
    ) -> Result<usize, PushError> {
        let series = remote_write::format_series(batch, &self.config.metric_prefix);
        let series_count = series.len();
        let body = remote_write::encode(series)?;

        let attempts = self
            .client
            .send(&body, api_key, self.config.send_timeout, policy, shutdown)
            .await?;

        self.metrics
            .observe_batch(self.client.endpoint_label(), series_count, body.len());
        debug!(
            batch_records = batch.len(),
            series = series_count,
            bytes = body.len(),
            attempts,
            "Delivered batch"
        );
        Ok(series_count)
    }
}

#[async_trait]
impl PeriodicJob for MetricsPusher {
    fn name(&self) -> &'static str {
        "metrics-pusher"
    }

    fn interval(&self) -> Duration {
        self.config.send_interval
    }

    async fn tick(&self, shutdown: &Shutdown) -> anyhow::Result<()> {
        let result = self.flush(shutdown).await;
        self.health.record_outcome(components::PUSHER, &result).await;
        result?;
        Ok(())
    }

    async fn on_shutdown(&self, shutdown: &Shutdown) {
        info!("Flushing pending records before shutdown");
        match self.flush(shutdown).await {
            Ok(report) => info!(records = report.delivered, "Final flush complete"),
            Err(e) => warn!(error = %e, "Final flush failed; records stay pending"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::models::ResourceKind;
    use crate::secrets::StaticApiKey;
    use prometheus::Registry;

    fn sized(name: &str, size: usize) -> ResourceRecord {
        let mut record = ResourceRecord::new(ResourceKind::Pod, name, None);
        record.size = size;
        record
    }

    fn batch_names(batches: &[Vec<ResourceRecord>]) -> Vec<Vec<&str>> {
        batches
            .iter()
            .map(|b| b.iter().map(|r| r.name.as_str()).collect())
            .collect()
    }

    #[test]
    fn test_pack_five_records_of_twenty_under_forty() {
        let records = (0..5).map(|i| sized(&format!("r{i}"), 20)).collect();
        let batches = pack_batches(records, 40);
        assert_eq!(
            batch_names(&batches),
            vec![vec!["r0", "r1"], vec!["r2", "r3"], vec!["r4"]]
        );
    }

    #[test]
    fn test_pack_oversized_record_travels_alone() {
        let records = vec![sized("a", 10), sized("huge", 100), sized("b", 10), sized("c", 25)];
        let batches = pack_batches(records, 40);
        assert_eq!(
            batch_names(&batches),
            vec![vec!["a"], vec!["huge"], vec!["b", "c"]]
        );
        for batch in &batches {
            let total: usize = batch.iter().map(|r| r.size).sum();
            assert!(total <= 40 || batch.len() == 1);
        }
    }

    #[test]
    fn test_pack_empty() {
        assert!(pack_batches(Vec::new(), 40).is_empty());
    }

    async fn pusher_with_key(key: &str) -> (MetricsPusher, ResourceStore) {
        let store = ResourceStore::open_in_memory(
            Arc::new(MockClock::default()),
            OutboxMetrics::new(&Registry::new()).unwrap(),
        )
        .await
        .unwrap();
        // nothing listens here; these tests must never reach the network
        let endpoint = Url::parse("http://127.0.0.1:9/v1/container-metrics").unwrap();
        let pusher = MetricsPusher::new(
            store.clone(),
            Arc::new(StaticApiKey::new(key)),
            PusherConfig::new(endpoint),
            HealthRegistry::new(),
        )
        .unwrap();
        (pusher, store)
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending_is_a_noop() {
        let (pusher, _store) = pusher_with_key("").await;
        let report = pusher.flush(&Shutdown::never()).await.unwrap();
        assert_eq!(report, FlushReport::default());
    }

    #[tokio::test]
    async fn test_flush_without_api_key_fails_before_sending() {
        let (pusher, store) = pusher_with_key("").await;
        let record = store
            .create(ResourceRecord::new(ResourceKind::Node, "node-a", None))
            .await
            .unwrap();

        let result = pusher.flush(&Shutdown::never()).await;
        assert!(matches!(result, Err(PushError::MissingApiKey)));
        assert!(store.get(&record.id).await.unwrap().sent_at.is_none());
        assert_eq!(
            store
                .metrics()
                .push_failures("http://127.0.0.1:9/v1/container-metrics"),
            1
        );
    }
}
