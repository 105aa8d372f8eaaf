//! Retention-based reclamation of delivered records

use crate::error::StoreResult;
use crate::health::{components, HealthRegistry};
use crate::store::{RecordQuery, ResourceStore};
use crate::task::{PeriodicJob, Shutdown};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HouseKeeperConfig {
    pub cleanup_interval: Duration,
    /// How long a delivered record is kept after its last activity
    pub retention: Duration,
}

impl Default for HouseKeeperConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(3 * 60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Deletes records that were delivered and have aged past retention.
///
/// Records never delivered are kept regardless of age.
pub struct HouseKeeper {
    store: ResourceStore,
    config: HouseKeeperConfig,
    health: HealthRegistry,
}

impl HouseKeeper {
    pub fn new(store: ResourceStore, config: HouseKeeperConfig, health: HealthRegistry) -> Self {
        Self {
            store,
            config,
            health,
        }
    }

    /// One reclamation pass; returns how many records were deleted.
    ///
    /// All matching records go in one transaction, so a failure deletes nothing.
    pub async fn run_once(&self) -> StoreResult<usize> {
        let now = self.store.clock().now();
        let cutoff = ChronoDuration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let deleted = self
            .store
            .tx(move |session| {
                let expired = session.find_all_by(&RecordQuery::Reclaimable { cutoff })?;
                let mut deleted = 0;
                for record in &expired {
                    deleted += session.delete(&record.id)?;
                }
                Ok(deleted)
            })
            .await?;

        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "Reclaimed delivered records");
        } else {
            debug!(cutoff = %cutoff, "No records past retention");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl PeriodicJob for HouseKeeper {
    fn name(&self) -> &'static str {
        "housekeeper"
    }

    fn interval(&self) -> Duration {
        self.config.cleanup_interval
    }

    async fn tick(&self, _shutdown: &Shutdown) -> anyhow::Result<()> {
        let result = self.run_once().await;
        self.health
            .record_outcome(components::HOUSEKEEPER, &result)
            .await;

        match result {
            Ok(deleted) => {
                self.store.metrics().inc_records_reclaimed(deleted);
                Ok(())
            }
            Err(e) => {
                self.store.metrics().inc_housekeeper_failure();
                warn!(error = %e, "Retention pass failed");
                Err(e.into())
            }
        }
    }
}
