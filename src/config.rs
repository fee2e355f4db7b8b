//! Service configuration, read from the environment (optionally via `.env`).

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::identity::IdentityConfig;
use crate::parser::{CompetitionThresholds, ParserConfig, VolumeScale};
use crate::proxy::ProxyTestConfig;
use crate::scheduler::{EngineConfig, SchedulerConfig};
use crate::session::SessionConfig;
use crate::trend::TrendConfig;

/// Every 15 minutes (seconds field first).
pub const DEFAULT_CYCLE_CRON: &str = "0 */15 * * * *";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub cycle_cron: String,
    pub notify_webhook_url: Option<String>,
    /// Fixed seed for every random choice; unset means OS entropy.
    pub rng_seed: Option<u64>,
    pub identity: IdentityConfig,
    pub session: SessionConfig,
    pub executor: ExecutorConfig,
    pub parser: ParserConfig,
    pub trend: TrendConfig,
    pub proxy_test: ProxyTestConfig,
    pub scheduler: SchedulerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let identity = IdentityConfig {
            interval_min_ms: env_or("REQUEST_INTERVAL_MIN_MS", 2_000)?,
            interval_max_ms: env_or("REQUEST_INTERVAL_MAX_MS", 8_000)?,
            ..IdentityConfig::default()
        };

        let session = SessionConfig {
            timeout: Duration::from_secs(env_or("SESSION_TIMEOUT_SECS", 300)?),
        };

        let mut executor = ExecutorConfig {
            max_attempts: env_or("FETCH_MAX_ATTEMPTS", 3)?,
            fetch_timeout: Duration::from_secs(env_or("FETCH_TIMEOUT_SECS", 30)?),
            backoff_base_ms: env_or("BACKOFF_BASE_MS", 1_000)?,
            backoff_cap_ms: env_or("BACKOFF_CAP_MS", 10_000)?,
            backoff_jitter_ms: env_or("BACKOFF_JITTER_MS", 1_000)?,
            ..ExecutorConfig::default()
        };
        if let Some(list) = env_list("BLOCK_SIGNATURES") {
            executor.block_signatures = list;
        }

        let parser = ParserConfig {
            competition: CompetitionThresholds {
                high: env_or("COMPETITION_HIGH", 8)?,
                medium: env_or("COMPETITION_MEDIUM", 4)?,
                low: env_or("COMPETITION_LOW", 1)?,
            },
            volume: VolumeScale {
                divisor: env_or("VOLUME_DIVISOR", 100)?,
                min: env_or("VOLUME_MIN", 100)?,
                max: env_or("VOLUME_MAX", 10_000)?,
            },
            ..ParserConfig::default()
        };

        let trend = TrendConfig {
            history_window_days: env_or("HISTORY_WINDOW_DAYS", 30)?,
            delta_window_days: env_or("DELTA_WINDOW_DAYS", 7)?,
            ..TrendConfig::default()
        };

        let proxy_test = ProxyTestConfig {
            url: env::var("PROXY_TEST_URL").unwrap_or_else(|_| ProxyTestConfig::default().url),
            timeout: Duration::from_secs(env_or("PROXY_TEST_TIMEOUT_SECS", 10)?),
        };

        let scheduler = SchedulerConfig {
            batch_size: env_or("CYCLE_BATCH_SIZE", 50)?,
            inter_job_delay_secs: (
                env_or("INTER_JOB_DELAY_MIN_SECS", 5)?,
                env_or("INTER_JOB_DELAY_MAX_SECS", 15)?,
            ),
            claim_lease: Duration::from_secs(env_or("CLAIM_LEASE_SECS", 3_600)?),
        };

        let config = Self {
            database_url,
            port: env_or("PORT", 3000)?,
            cycle_cron: env::var("CYCLE_CRON").unwrap_or_else(|_| DEFAULT_CYCLE_CRON.to_string()),
            notify_webhook_url: env::var("NOTIFY_WEBHOOK_URL").ok().filter(|s| !s.trim().is_empty()),
            rng_seed: env::var("RNG_SEED").ok().map(|s| s.parse()).transpose().context("RNG_SEED")?,
            identity,
            session,
            executor,
            parser,
            trend,
            proxy_test,
            scheduler,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            identity: self.identity.clone(),
            session: self.session.clone(),
            executor: self.executor.clone(),
            parser: self.parser.clone(),
            trend: self.trend.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_range("REQUEST_INTERVAL_*_MS", self.identity.interval_min_ms, self.identity.interval_max_ms)?;
        check_range(
            "INTER_JOB_DELAY_*_SECS",
            self.scheduler.inter_job_delay_secs.0,
            self.scheduler.inter_job_delay_secs.1,
        )?;
        check_range("VOLUME_MIN/VOLUME_MAX", self.parser.volume.min, self.parser.volume.max)?;
        if self.executor.max_attempts == 0 {
            anyhow::bail!("FETCH_MAX_ATTEMPTS must be at least 1");
        }
        if self.scheduler.batch_size == 0 {
            anyhow::bail!("CYCLE_BATCH_SIZE must be at least 1");
        }
        if self.parser.volume.divisor == 0 {
            anyhow::bail!("VOLUME_DIVISOR must be non-zero");
        }
        if self.trend.delta_window_days > self.trend.history_window_days {
            anyhow::bail!("DELTA_WINDOW_DAYS must not exceed HISTORY_WINDOW_DAYS");
        }
        Ok(())
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid value for {}: '{}' ({})", key, raw, e)),
        _ => Ok(default),
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let items: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect();
    (!items.is_empty()).then_some(items)
}

fn check_range<T: PartialOrd + std::fmt::Display>(name: &str, min: T, max: T) -> Result<()> {
    if min > max {
        anyhow::bail!("{}: minimum {} exceeds maximum {}", name, min, max);
    }
    Ok(())
}
