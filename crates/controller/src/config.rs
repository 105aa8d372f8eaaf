//! Controller configuration

use anyhow::{bail, Context, Result};
use config::{builder::DefaultState, ConfigBuilder, Environment, File};
use controller_lib::{HouseKeeperConfig, PusherConfig, SecretMonitorConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Environment variable naming an optional config file
pub const CONFIG_FILE_ENV: &str = "INSIGHTS_CONFIG_FILE";

const ENV_PREFIX: &str = "INSIGHTS";
const REMOTE_WRITE_PATH: &str = "/v1/container-metrics";

const DEFAULT_HOST: &str = "api.cloudzero.com";
const DEFAULT_SEND_INTERVAL_SECS: u64 = 60;
const DEFAULT_SEND_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_BYTES_PER_SEND: usize = 500_000;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_METRIC_PREFIX: &str = "cloudzero";
const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3 * 60 * 60;
const DEFAULT_SECRET_REFRESH_SECS: u64 = 60;
const DEFAULT_SERVER_PORT: u16 = 8080;

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Name of the monitored cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Cloud provider account the cluster runs in
    #[serde(default)]
    pub cloud_account_id: String,

    #[serde(default)]
    pub region: String,

    /// File holding the remote-write bearer credential
    #[serde(default)]
    pub api_key_path: PathBuf,

    #[serde(default = "default_secret_refresh")]
    pub secret_refresh_interval_secs: u64,

    #[serde(default)]
    pub remote_write: RemoteWriteSettings,

    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteWriteSettings {
    /// Ingestion host, or a full base URL when it carries a scheme
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_send_interval")]
    pub send_interval_secs: u64,

    /// Timeout for each individual POST
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    #[serde(default = "default_max_bytes_per_send")]
    pub max_bytes_per_send: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,
}

impl Default for RemoteWriteSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            send_interval_secs: default_send_interval(),
            send_timeout_secs: default_send_timeout(),
            max_bytes_per_send: default_max_bytes_per_send(),
            max_retries: default_max_retries(),
            metric_prefix: default_metric_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    /// Directory holding the database file; the outbox lives in memory when unset
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// How long delivered records are kept
    #[serde(default = "default_retention")]
    pub retention_secs: u64,

    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            storage_path: None,
            retention_secs: default_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Port for health and metrics endpoints
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_send_interval() -> u64 {
    DEFAULT_SEND_INTERVAL_SECS
}

fn default_send_timeout() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}

fn default_max_bytes_per_send() -> usize {
    DEFAULT_MAX_BYTES_PER_SEND
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_metric_prefix() -> String {
    DEFAULT_METRIC_PREFIX.to_string()
}

fn default_retention() -> u64 {
    DEFAULT_RETENTION_SECS
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_SECS
}

fn default_secret_refresh() -> u64 {
    DEFAULT_SECRET_REFRESH_SECS
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_log_level() -> String {
    "info".to_string()
}

impl ControllerConfig {
    /// Load configuration from the optional config file and the environment
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(File::from(PathBuf::from(&path)));
        }
        Self::from_builder(builder)
    }

    /// Layer environment overrides (`INSIGHTS_REMOTE_WRITE__MAX_RETRIES=5`)
    /// on top of `builder`, then deserialize and validate.
    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self> {
        let mut config: Self = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Trim and require the cluster identity; zero values fall back to defaults.
    pub fn validate(&mut self) -> Result<()> {
        self.cloud_account_id = self.cloud_account_id.trim().to_string();
        if self.cloud_account_id.is_empty() {
            bail!("cloud account ID is empty");
        }
        self.region = self.region.trim().to_string();
        if self.region.is_empty() {
            bail!("region is empty");
        }
        self.cluster_name = self.cluster_name.trim().to_string();
        if self.cluster_name.is_empty() {
            bail!("cluster name is empty");
        }
        if self.api_key_path.as_os_str().is_empty() {
            bail!("API key path is empty");
        }

        let rw = &mut self.remote_write;
        rw.host = rw.host.trim().to_string();
        if rw.host.is_empty() {
            rw.host = default_host();
        }
        fill_zero(&mut rw.send_interval_secs, DEFAULT_SEND_INTERVAL_SECS);
        fill_zero(&mut rw.send_timeout_secs, DEFAULT_SEND_TIMEOUT_SECS);
        fill_zero(&mut rw.max_bytes_per_send, DEFAULT_MAX_BYTES_PER_SEND);
        fill_zero(&mut rw.max_retries, DEFAULT_MAX_RETRIES);
        if rw.metric_prefix.is_empty() {
            rw.metric_prefix = default_metric_prefix();
        }

        fill_zero(&mut self.database.retention_secs, DEFAULT_RETENTION_SECS);
        fill_zero(
            &mut self.database.cleanup_interval_secs,
            DEFAULT_CLEANUP_INTERVAL_SECS,
        );
        fill_zero(
            &mut self.secret_refresh_interval_secs,
            DEFAULT_SECRET_REFRESH_SECS,
        );
        fill_zero(&mut self.server.port, DEFAULT_SERVER_PORT);

        Ok(())
    }

    /// `https://<host>/v1/container-metrics?cluster_name=..&cloud_account_id=..&region=..`
    pub fn remote_write_url(&self) -> Result<Url> {
        let host = &self.remote_write.host;
        let base = if host.contains("://") {
            host.clone()
        } else {
            format!("https://{host}")
        };
        let mut url =
            Url::parse(&base).with_context(|| format!("invalid remote write host {host:?}"))?;

        let path = format!("{}{}", url.path().trim_end_matches('/'), REMOTE_WRITE_PATH);
        url.set_path(&path);
        url.query_pairs_mut()
            .clear()
            .append_pair("cluster_name", &self.cluster_name)
            .append_pair("cloud_account_id", &self.cloud_account_id)
            .append_pair("region", &self.region);
        Ok(url)
    }

    pub fn pusher_config(&self) -> Result<PusherConfig> {
        let rw = &self.remote_write;
        let mut config = PusherConfig::new(self.remote_write_url()?);
        config.send_interval = Duration::from_secs(rw.send_interval_secs);
        config.send_timeout = Duration::from_secs(rw.send_timeout_secs);
        config.max_bytes_per_send = rw.max_bytes_per_send;
        config.max_retries = rw.max_retries;
        config.metric_prefix = rw.metric_prefix.clone();
        Ok(config)
    }

    pub fn housekeeper_config(&self) -> HouseKeeperConfig {
        HouseKeeperConfig {
            cleanup_interval: Duration::from_secs(self.database.cleanup_interval_secs),
            retention: Duration::from_secs(self.database.retention_secs),
        }
    }

    pub fn secret_monitor_config(&self) -> SecretMonitorConfig {
        SecretMonitorConfig {
            refresh_interval: Duration::from_secs(self.secret_refresh_interval_secs),
        }
    }
}

fn fill_zero<T: Default + PartialEq>(value: &mut T, default: T) {
    if *value == T::default() {
        *value = default;
    }
}
