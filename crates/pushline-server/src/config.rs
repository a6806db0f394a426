use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pushline_core::PlanTable;
use pushline_db_postgres::PostgresConfig;
use pushline_delivery::SmtpConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Plan ceilings. Overridable per deployment; defaults match the
    /// published free/pro/business limits.
    #[serde(default)]
    pub plans: PlanTable,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.delivery.dispatch_timeout_secs == 0 {
            return Err("delivery.dispatch_timeout_secs must be > 0".into());
        }
        if self.delivery.retry_batch_size == 0 {
            return Err("delivery.retry_batch_size must be > 0".into());
        }
        if self.rate_limit.window_ms == 0 {
            return Err("rate_limit.window_ms must be > 0".into());
        }
        if self.rate_limit.push_per_window == 0 || self.rate_limit.pushover_per_window == 0 {
            return Err("rate_limit limits must be > 0".into());
        }
        if let StorageBackend::Postgres = self.storage.backend {
            if self.storage.postgres.is_none() {
                return Err("storage.backend=postgres requires [storage.postgres]".into());
            }
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        use std::net::{IpAddr, Ipv4Addr};
        let host: IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)));
        SocketAddr::from((host, self.server.port))
    }

    /// Base URL for links and responses; computed from host:port when unset.
    pub fn base_url(&self) -> String {
        self.server
            .base_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    256 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_url: None,
            body_limit_bytes: default_body_limit(),
        }
    }
}

/// Which storage backend to run on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// DashMap-backed storage; state is lost on restart. Local development
    /// and tests only.
    Memory,
    #[default]
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Postgres,
            postgres: Some(PostgresConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// SMTP relay for the email channel. Unset = email delivery is a
    /// logged no-op.
    #[serde(default)]
    pub smtp: SmtpConfig,
    /// Expo push endpoint; overridable for tests.
    #[serde(default = "default_expo_url")]
    pub expo_url: String,
    /// Upper bound on any single dispatch, in seconds.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,
    /// Retry attempt budget per delivery before it is marked permanently
    /// failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_expo_url() -> String {
    pushline_delivery::adapters::expo::DEFAULT_EXPO_URL.into()
}
fn default_dispatch_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_batch_size() -> u32 {
    50
}
fn default_retry_interval_secs() -> u64 {
    30
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            smtp: SmtpConfig::default(),
            expo_url: default_expo_url(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            max_retries: default_max_retries(),
            retry_batch_size: default_retry_batch_size(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl DeliveryConfig {
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    /// Requests per window on `/push/{topic}`, per client IP.
    #[serde(default = "default_push_per_window")]
    pub push_per_window: i64,
    /// Requests per window on the Pushover endpoints, per client IP.
    #[serde(default = "default_pushover_per_window")]
    pub pushover_per_window: i64,
}

fn default_window_ms() -> i64 {
    60_000
}
fn default_push_per_window() -> i64 {
    120
}
fn default_pushover_per_window() -> i64 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            push_per_window: default_push_per_window(),
            pushover_per_window: default_pushover_per_window(),
        }
    }
}

pub mod loader {
    use super::AppConfig;
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        match path {
            Some(p) => {
                let pathbuf = PathBuf::from(p);
                if pathbuf.exists() {
                    builder = builder.add_source(File::from(pathbuf));
                }
            }
            None => {
                let default_path = PathBuf::from("pushline.toml");
                if default_path.exists() {
                    builder = builder.add_source(File::from(default_path));
                }
            }
        }
        // Environment overrides, e.g. PUSHLINE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("PUSHLINE")
                .try_parsing(true)
                .separator("__"),
        );
        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.rate_limit.push_per_window, 120);
        assert_eq!(cfg.delivery.dispatch_timeout_secs, 30);
    }

    #[test]
    fn test_postgres_backend_requires_section() {
        let mut cfg = AppConfig::default();
        cfg.storage.postgres = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_plan_table_from_toml() {
        let cfg: AppConfig = toml::from_str(
            r#"
            [plans.free]
            pushes = 7
            topics = 2
            private_topics = false
            webhooks = false
            "#,
        )
        .unwrap();
        assert_eq!(cfg.plans.free.pushes, 7);
        assert_eq!(cfg.plans.free.topics, Some(2));
        // Untouched plans keep their published defaults.
        assert_eq!(cfg.plans.pro.pushes, 10_000);
    }
}
