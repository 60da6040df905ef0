use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;

/// Application configuration loaded from environment variables.
///
/// Built once at startup and handed to each component constructor.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Logical service name. Namespaces every store key and selects filter rules.
    pub service_name: String,

    /// Deployment environment tag (e.g. "dev", "prod"), shown upper-cased in titles.
    pub environment: String,

    /// PostgreSQL connection string (filter rule backing store)
    pub database_url: String,

    /// Redis connection string
    pub redis_url: String,

    /// Maximum number of PostgreSQL connections in the pool (default: 5)
    pub db_max_connections: u32,

    /// Alarm dispatch settings
    pub alarm: AlarmConfig,
}

/// Settings for the alarm dispatch engine.
#[derive(Debug, Clone, Deserialize)]
pub struct AlarmConfig {
    /// Platform used when a caller does not name one.
    pub default_platform: String,

    /// Webhook endpoint per platform name.
    pub webhooks: HashMap<String, String>,

    /// Number of delivery workers (default: 3)
    pub concurrency: usize,

    /// When set, alarms are logged instead of being queued for delivery.
    pub dry_run: bool,

    /// Window in which repeats of the same alarm are counted (default: 60s)
    pub cooldown_window: Duration,

    /// How long a fused alarm stays suppressed (default: 10 min)
    pub fuse_duration: Duration,

    /// TTL of the cached filter rule set (default: 8h)
    pub rule_cache_ttl: Duration,

    /// Retry ceiling stamped on every new message (default: 3)
    pub max_retry: u32,

    /// Bounded wait for a blocking pop on the primary queue (default: 10s)
    pub dequeue_timeout: Duration,

    /// Bounded wait for a single outbound send (default: 60s)
    pub send_timeout: Duration,

    /// Delayed queue promotion period (default: 1s)
    pub promote_interval: Duration,

    /// Maximum entries moved per promotion cycle (default: 100)
    pub promote_batch: usize,
}

/// Default number of delivery workers.
pub const DEFAULT_CONCURRENCY: usize = 3;

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            service_name: std::env::var("SERVICE_NAME").unwrap_or_else(|_| "herald".to_string()),
            environment: std::env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string()),
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 5)?,
            alarm: AlarmConfig::from_env()?,
        };

        config.alarm.validate()?;
        Ok(config)
    }
}

impl AlarmConfig {
    /// Load the alarm section from `ALARM_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let webhooks = std::env::var("ALARM_WEBHOOKS")
            .map(|raw| parse_webhooks(&raw))
            .unwrap_or_else(|_| Ok(HashMap::new()))?;

        Ok(Self {
            default_platform: std::env::var("ALARM_DEFAULT_PLATFORM").map_err(|_| {
                anyhow::anyhow!("ALARM_DEFAULT_PLATFORM environment variable is required")
            })?,
            webhooks,
            concurrency: env_or("ALARM_CONCURRENCY", DEFAULT_CONCURRENCY)?,
            dry_run: env_or("ALARM_DRY_RUN", false)?,
            cooldown_window: Duration::from_secs(env_or("ALARM_COOLDOWN_WINDOW_SECS", 60)?),
            fuse_duration: Duration::from_secs(env_or("ALARM_FUSE_DURATION_SECS", 600)?),
            rule_cache_ttl: Duration::from_secs(env_or("ALARM_RULE_CACHE_TTL_SECS", 8 * 3600)?),
            max_retry: env_or("ALARM_MAX_RETRY", 3)?,
            dequeue_timeout: Duration::from_secs(env_or("ALARM_DEQUEUE_TIMEOUT_SECS", 10)?),
            send_timeout: Duration::from_secs(env_or("ALARM_SEND_TIMEOUT_SECS", 60)?),
            promote_interval: Duration::from_millis(env_or("ALARM_PROMOTE_INTERVAL_MS", 1000)?),
            promote_batch: env_or("ALARM_PROMOTE_BATCH", 100)?,
        })
    }

    /// Check the settings the dispatcher cannot run without.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.default_platform.is_empty()
            || self
                .webhooks
                .get(&self.default_platform)
                .is_none_or(|url| url.is_empty())
        {
            return Err(AppError::Config(format!(
                "Invalid alarm default platform '{}': it must have a configured webhook",
                self.default_platform
            )));
        }
        if self.promote_interval.is_zero() {
            return Err(AppError::Config(
                "ALARM_PROMOTE_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }
        if self.promote_batch == 0 {
            return Err(AppError::Config(
                "ALARM_PROMOTE_BATCH must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Worker count with zero mapped to the default.
    pub fn worker_count(&self) -> usize {
        if self.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.concurrency
        }
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            default_platform: String::new(),
            webhooks: HashMap::new(),
            concurrency: DEFAULT_CONCURRENCY,
            dry_run: false,
            cooldown_window: Duration::from_secs(60),
            fuse_duration: Duration::from_secs(600),
            rule_cache_ttl: Duration::from_secs(8 * 3600),
            max_retry: 3,
            dequeue_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(60),
            promote_interval: Duration::from_secs(1),
            promote_batch: 100,
        }
    }
}

/// Parse `name=url,name=url` into a platform map.
pub fn parse_webhooks(raw: &str) -> anyhow::Result<HashMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (name, url) = pair
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("ALARM_WEBHOOKS entry '{}' must be name=url", pair))?;
            Ok((name.trim().to_string(), url.trim().to_string()))
        })
        .collect()
}

fn env_or<T: FromStr>(name: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| anyhow::anyhow!("{} has an invalid value '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(default_platform: &str, webhooks: &[(&str, &str)]) -> AlarmConfig {
        AlarmConfig {
            default_platform: default_platform.to_string(),
            webhooks: webhooks
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..AlarmConfig::default()
        }
    }

    #[test]
    fn test_parse_webhooks() {
        let hooks = parse_webhooks("ops=https://hooks.example/ops, biz = https://hooks.example/biz,")
            .unwrap();
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks["ops"], "https://hooks.example/ops");
        assert_eq!(hooks["biz"], "https://hooks.example/biz");
    }

    #[test]
    fn test_parse_webhooks_rejects_missing_separator() {
        assert!(parse_webhooks("ops").is_err());
    }

    #[test]
    fn test_validate_requires_default_webhook() {
        assert!(config_with("", &[]).validate().is_err());
        assert!(config_with("ops", &[("biz", "https://x")]).validate().is_err());
        assert!(config_with("ops", &[("ops", "")]).validate().is_err());
        assert!(config_with("ops", &[("ops", "https://x")]).validate().is_ok());
    }

    #[test]
    fn test_zero_concurrency_uses_default() {
        let mut config = config_with("ops", &[("ops", "https://x")]);
        config.concurrency = 0;
        assert_eq!(config.worker_count(), DEFAULT_CONCURRENCY);
        config.concurrency = 8;
        assert_eq!(config.worker_count(), 8);
    }
}
