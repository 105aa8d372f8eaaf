//! HTTP transport for remote-write payloads

use crate::error::PushError;
use crate::observability::{OutboxMetrics, NO_RESPONSE};
use crate::task::Shutdown;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use url::Url;

const USER_AGENT: &str = concat!("insights-controller/", env!("CARGO_PKG_VERSION"));
const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Attempt budget and backoff schedule for one payload
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every attempt after that
    pub backoff_base: Duration,
    /// Upper bound of the uniform jitter added to each delay
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// `2^attempt * base + U[0, max_jitter]`, where `attempt` counts from 0
    pub fn backoff<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let exp = self.backoff_base.saturating_mul(1u32 << attempt.min(16));
        let jitter_nanos = self.max_jitter.as_nanos().min(u64::MAX as u128) as u64;
        exp + Duration::from_nanos(rng.gen_range(0..=jitter_nanos))
    }
}

/// Posts compressed write requests to one endpoint
pub struct RemoteWriteClient {
    http: reqwest::Client,
    endpoint: Url,
    endpoint_label: String,
    metrics: OutboxMetrics,
    rng: Mutex<StdRng>,
}

impl RemoteWriteClient {
    pub fn new(endpoint: Url, metrics: OutboxMetrics) -> Result<Self, PushError> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

        // query parameters carry account identifiers; keep them out of metric labels
        let mut bare = endpoint.clone();
        bare.set_query(None);

        Ok(Self {
            http,
            endpoint,
            endpoint_label: bare.to_string(),
            metrics,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Endpoint as it appears in metric labels (no query string)
    pub fn endpoint_label(&self) -> &str {
        &self.endpoint_label
    }

    /// Deliver `body`, retrying transient failures per `policy`.
    ///
    /// Once `shutdown` is signalled no further retries are started, so a
    /// payload sent during shutdown gets a single attempt; a backoff sleep cut
    /// short by shutdown yields [`PushError::Cancelled`]. Returns the number
    /// of attempts used.
    pub async fn send(
        &self,
        body: &[u8],
        api_key: &str,
        timeout: Duration,
        policy: &RetryPolicy,
        shutdown: &Shutdown,
    ) -> Result<u32, PushError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match self.post(body, api_key, timeout).await {
                Ok(()) => return Ok(attempt),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= max_attempts || shutdown.is_signalled() {
                return Err(PushError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = {
                let mut rng = self.rng();
                policy.backoff(attempt - 1, &mut *rng)
            };
            warn!(
                endpoint = %self.endpoint_label,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Remote write attempt failed, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.signalled() => {
                    debug!(endpoint = %self.endpoint_label, attempt, "Retry abandoned on shutdown");
                    return Err(PushError::Cancelled);
                }
            }
        }
    }

    async fn post(&self, body: &[u8], api_key: &str, timeout: Duration) -> Result<(), PushError> {
        let started = Instant::now();
        let result = self
            .http
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header(CONTENT_ENCODING, "snappy")
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .bearer_auth(api_key)
            .timeout(timeout)
            .body(body.to_vec())
            .send()
            .await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => {
                let status = response.status();
                self.metrics
                    .observe_request(&self.endpoint_label, status.as_str(), elapsed);
                if status.is_success() {
                    debug!(
                        endpoint = %self.endpoint_label,
                        status = status.as_u16(),
                        bytes = body.len(),
                        "Remote write accepted"
                    );
                    Ok(())
                } else {
                    Err(PushError::Status(status.as_u16()))
                }
            }
            Err(e) => {
                self.metrics
                    .observe_request(&self.endpoint_label, NO_RESPONSE, elapsed);
                if e.is_timeout() {
                    Err(PushError::Timeout)
                } else {
                    Err(PushError::Request(e))
                }
            }
        }
    }

    fn rng(&self) -> MutexGuard<'_, StdRng> {
        self.rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
