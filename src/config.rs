use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::ReconcilerConfig;
use crate::utils::RetryConfig;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Unset runs against the in-memory backend.
    pub database_url: Option<String>,
    pub metrics_port: u16,
    pub append_max_attempts: u32,
    pub projection_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub request_timeout: Duration,
    pub read_page_size: usize,
    pub reconcile_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            metrics_port: 9090,
            append_max_attempts: 3,
            projection_max_attempts: 3,
            retry_initial_delay: Duration::from_millis(100),
            request_timeout: Duration::from_secs(5),
            read_page_size: crate::event_sourcing::DEFAULT_PAGE_SIZE,
            reconcile_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log();
        Ok(config)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()),
            metrics_port: parse_or(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            append_max_attempts: parse_or(&lookup, "APPEND_MAX_ATTEMPTS", defaults.append_max_attempts)?,
            projection_max_attempts: parse_or(
                &lookup,
                "PROJECTION_MAX_ATTEMPTS",
                defaults.projection_max_attempts,
            )?,
            retry_initial_delay: Duration::from_millis(parse_or(
                &lookup,
                "RETRY_INITIAL_DELAY_MS",
                defaults.retry_initial_delay.as_millis() as u64,
            )?),
            request_timeout: Duration::from_millis(parse_or(
                &lookup,
                "REQUEST_TIMEOUT_MS",
                defaults.request_timeout.as_millis() as u64,
            )?),
            read_page_size: parse_or(&lookup, "READ_PAGE_SIZE", defaults.read_page_size)?,
            reconcile_interval: Duration::from_secs(parse_or(
                &lookup,
                "RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )?),
        })
    }

    pub fn append_retry(&self) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(self.append_max_attempts)
            .with_initial_delay(self.retry_initial_delay)
    }

    pub fn projection_retry(&self) -> RetryConfig {
        RetryConfig::default()
            .with_max_attempts(self.projection_max_attempts)
            .with_initial_delay(self.retry_initial_delay)
    }

    pub fn reconciler(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            interval: self.reconcile_interval,
            ..ReconcilerConfig::default()
        }
    }

    fn log(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  DATABASE_URL: {}",
            if self.database_url.is_some() { "<set>" } else { "<not set, using in-memory backend>" }
        );
        tracing::info!("  METRICS_PORT: {}", self.metrics_port);
        tracing::info!(
            "  retries: append={} projection={} initial_delay={:?}",
            self.append_max_attempts,
            self.projection_max_attempts,
            self.retry_initial_delay
        );
        tracing::info!("  READ_PAGE_SIZE: {}", self.read_page_size);
        tracing::info!("  RECONCILE_INTERVAL_SECS: {}", self.reconcile_interval.as_secs());
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
