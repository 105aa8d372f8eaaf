//! API key access and rotation
//!
//! The pusher reads the bearer credential through [`ApiKeyProvider`] on every
//! flush. [`SecretMonitor`] periodically re-reads the key file so a rotated
//! secret is picked up without a restart.

use crate::health::{components, HealthRegistry};
use crate::task::{PeriodicJob, Shutdown};
use anyhow::Context;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Source of the bearer credential
pub trait ApiKeyProvider: Send + Sync {
    /// Current key; empty when none is available
    fn api_key(&self) -> String;
}

/// A fixed key
#[derive(Debug, Clone)]
pub struct StaticApiKey(String);

impl StaticApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }
}

impl ApiKeyProvider for StaticApiKey {
    fn api_key(&self) -> String {
        self.0.clone()
    }
}

/// A key read from a file, surrounding whitespace trimmed
#[derive(Debug)]
pub struct FileApiKey {
    path: PathBuf,
    value: RwLock<String>,
}

impl FileApiKey {
    /// Read `path` now; fails if the file cannot be read.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let key = Self {
            path: path.into(),
            value: RwLock::new(String::new()),
        };
        key.reload()?;
        Ok(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file. On failure the previous value is kept.
    pub fn reload(&self) -> std::io::Result<()> {
        let contents = std::fs::read_to_string(&self.path)?;
        let mut value = self.value.write().unwrap_or_else(|p| p.into_inner());
        *value = contents.trim().to_string();
        Ok(())
    }
}

impl ApiKeyProvider for FileApiKey {
    fn api_key(&self) -> String {
        self.value
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// First two characters followed by `***`; short secrets are fully masked
pub fn redact_secret(secret: &str) -> String {
    if secret.chars().count() > 2 {
        let prefix: String = secret.chars().take(2).collect();
        format!("{prefix}***")
    } else {
        "*****".to_string()
    }
}

#[derive(Debug, Clone)]
pub struct SecretMonitorConfig {
    pub refresh_interval: Duration,
}

impl Default for SecretMonitorConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Periodic reload of a [`FileApiKey`], logging (redacted) when it changes
pub struct SecretMonitor {
    key: Arc<FileApiKey>,
    config: SecretMonitorConfig,
    last_hash: Mutex<Option<String>>,
    health: HealthRegistry,
}

impl SecretMonitor {
    pub fn new(key: Arc<FileApiKey>, config: SecretMonitorConfig, health: HealthRegistry) -> Self {
        let initial = hash_secret(&key.api_key());
        Self {
            key,
            config,
            last_hash: Mutex::new(Some(initial)),
            health,
        }
    }

    /// Reload once; returns whether the key changed.
    pub async fn refresh(&self) -> anyhow::Result<bool> {
        let reloaded = self
            .key
            .reload()
            .with_context(|| format!("failed to read API key from {}", self.key.path().display()));
        self.health.record_outcome(components::SECRETS, &reloaded).await;
        reloaded?;

        let secret = self.key.api_key();
        let hash = hash_secret(&secret);
        let mut last = self.last_hash.lock().unwrap_or_else(|p| p.into_inner());
        if last.as_deref() == Some(hash.as_str()) {
            return Ok(false);
        }

        info!(secret = %redact_secret(&secret), "Discovered new API key");
        *last = Some(hash);
        Ok(true)
    }
}

fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[async_trait]
impl PeriodicJob for SecretMonitor {
    fn name(&self) -> &'static str {
        "secret-monitor"
    }

    fn interval(&self) -> Duration {
        self.config.refresh_interval
    }

    async fn tick(&self, _shutdown: &Shutdown) -> anyhow::Result<()> {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Keeping previous API key");
            return Err(e);
        }
        Ok(())
    }
}
