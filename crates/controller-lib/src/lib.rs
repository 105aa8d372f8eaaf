//! Controller library for the resource metadata outbox
//!
//! This crate provides the core functionality for:
//! - Durable storage of observed resource labels and annotations
//! - Reliable remote-write delivery of pending records
//! - Retention-based reclamation of delivered records
//! - API key rotation, health checks and observability

pub mod clock;
pub mod error;
pub mod health;
pub mod housekeeper;
pub mod models;
pub mod observability;
pub mod outbox;
pub mod pusher;
pub mod remote_write;
pub mod secrets;
pub mod store;
pub mod task;

pub use clock::{Clock, MockClock, SystemClock};
pub use error::{PushError, StoreError, StoreResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use housekeeper::{HouseKeeper, HouseKeeperConfig};
pub use models::*;
pub use observability::OutboxMetrics;
pub use outbox::{Observation, OutboxWriter};
pub use pusher::{pack_batches, FlushReport, MetricsPusher, PusherConfig};
pub use secrets::{ApiKeyProvider, FileApiKey, SecretMonitor, SecretMonitorConfig, StaticApiKey};
pub use store::{RecordQuery, ResourceStore, Session, UpsertOutcome};
pub use task::{spawn_periodic, BackgroundService, PeriodicJob, Shutdown, TaskHandle};
