use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{CompetitionLevel, JobStatus, Marketplace, PositionSample, TrackingJob};
use crate::proxy::{ProxyEndpoint, ProxyTestResult};
use crate::store::{DueJobs, RequestLogEntry, TrackingStore, UnreadableJob};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tracking_jobs (
        id UUID PRIMARY KEY,
        user_id UUID NOT NULL,
        asin VARCHAR NOT NULL,
        marketplace VARCHAR NOT NULL DEFAULT 'US',
        keywords TEXT[] NOT NULL DEFAULT '{}',
        tracking_frequency VARCHAR NOT NULL DEFAULT 'daily',
        delay_min_secs INTEGER NOT NULL DEFAULT 2,
        delay_max_secs INTEGER NOT NULL DEFAULT 8,
        status VARCHAR NOT NULL DEFAULT 'active',
        last_run_at TIMESTAMPTZ,
        next_run_at TIMESTAMPTZ,
        claimed_until TIMESTAMPTZ,
        claimed_by UUID,
        created_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP,
        CHECK (next_run_at IS NULL OR last_run_at IS NULL OR next_run_at >= last_run_at)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS position_history (
        id BIGSERIAL PRIMARY KEY,
        tracking_job_id UUID NOT NULL REFERENCES tracking_jobs(id),
        keyword VARCHAR NOT NULL,
        organic_position INTEGER,
        sponsored_position INTEGER,
        search_volume INTEGER,
        competition_level VARCHAR NOT NULL DEFAULT 'unknown',
        tracked_at TIMESTAMPTZ NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_position_history_job_keyword
        ON position_history (tracking_job_id, keyword, tracked_at DESC);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS proxy_configurations (
        id VARCHAR PRIMARY KEY,
        user_id UUID NOT NULL,
        host VARCHAR NOT NULL,
        port INTEGER NOT NULL,
        username VARCHAR,
        password VARCHAR,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        regions TEXT[] NOT NULL DEFAULT '{US}',
        last_test_result JSONB,
        updated_at TIMESTAMPTZ DEFAULT CURRENT_TIMESTAMP
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_requests (
        id BIGSERIAL PRIMARY KEY,
        tracking_job_id UUID REFERENCES tracking_jobs(id),
        user_id UUID NOT NULL,
        keyword VARCHAR,
        marketplace VARCHAR NOT NULL,
        success BOOLEAN NOT NULL,
        error_message TEXT,
        user_agent TEXT,
        response_time_ms BIGINT,
        data_used BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_api_requests_user_created
        ON api_requests (user_id, created_at);
    "#,
];

const JOB_COLUMNS: &str = "id, user_id, asin, marketplace, keywords, tracking_frequency, \
    delay_min_secs, delay_max_secs, status, last_run_at, next_run_at";

const SAMPLE_COLUMNS: &str = "organic_position, sponsored_position, search_volume, competition_level, tracked_at";

pub async fn connect_with_retry(db_url: &str) -> Result<PgPool> {
    info!("🔌 Connecting to Database...");
    let mut attempts = 0;
    loop {
        match PgPoolOptions::new().max_connections(5).connect(db_url).await {
            Ok(pool) => {
                info!("✅ Database Connected!");
                return Ok(pool);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= 15 {
                    return Err(e).context("failed to connect to database after 15 attempts");
                }
                warn!("⚠️ DB Connect failed ({}), retrying in 2s... (Attempt {}/15)", e, attempts);
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

pub async fn init_db(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    claim_lease: Duration,
    /// Written to `claimed_by` so renewals only succeed for our own claims.
    instance_id: Uuid,
}

impl PgStore {
    pub fn new(pool: PgPool, claim_lease: Duration) -> Self {
        let instance_id = Uuid::new_v4();
        info!("🔖 [Store] Claiming jobs as instance {}", instance_id);
        Self {
            pool,
            claim_lease,
            instance_id,
        }
    }
}

fn job_from_row(row: &PgRow) -> Result<TrackingJob> {
    let delay_min: i32 = row.try_get("delay_min_secs")?;
    let delay_max: i32 = row.try_get("delay_max_secs")?;
    let marketplace: String = row.try_get("marketplace")?;
    let frequency: String = row.try_get("tracking_frequency")?;
    let status: String = row.try_get("status")?;

    let delay_min = delay_min.max(0) as u64;
    Ok(TrackingJob {
        id: row.try_get("id")?,
        user_scope: row.try_get("user_id")?,
        target_id: row.try_get("asin")?,
        marketplace: Marketplace::from_code_or_default(&marketplace),
        keywords: row.try_get("keywords")?,
        frequency: frequency.parse()?,
        delay_range_secs: (delay_min, (delay_max.max(0) as u64).max(delay_min)),
        status: status.parse()?,
        last_run_at: row.try_get("last_run_at")?,
        next_run_at: row.try_get("next_run_at")?,
    })
}

fn sample_from_row(row: &PgRow) -> Result<PositionSample> {
    let position = |col: &str| -> Result<Option<u32>> {
        let v: Option<i32> = row.try_get(col)?;
        Ok(v.and_then(|v| u32::try_from(v).ok()))
    };
    let competition: String = row.try_get("competition_level")?;
    Ok(PositionSample {
        organic_position: position("organic_position")?,
        sponsored_position: position("sponsored_position")?,
        search_volume_estimate: position("search_volume")?,
        competition_level: competition.parse().unwrap_or(CompetitionLevel::Unknown),
        tracked_at: row.try_get("tracked_at")?,
    })
}

fn request_from_row(row: &PgRow) -> Result<RequestLogEntry> {
    let marketplace: String = row.try_get("marketplace")?;
    let response_time_ms: Option<i64> = row.try_get("response_time_ms")?;
    let data_used: i64 = row.try_get("data_used")?;
    let keyword: Option<String> = row.try_get("keyword")?;
    Ok(RequestLogEntry {
        job_id: row.try_get("tracking_job_id")?,
        user_scope: row.try_get("user_id")?,
        keyword: keyword.unwrap_or_default(),
        marketplace: Marketplace::from_code_or_default(&marketplace),
        success: row.try_get("success")?,
        error_message: row.try_get("error_message")?,
        user_agent: row.try_get("user_agent")?,
        response_time_ms: response_time_ms.unwrap_or(0).max(0) as u64,
        data_used: data_used.max(0) as u64,
        requested_at: row.try_get("created_at")?,
    })
}

fn proxy_from_row(row: &PgRow) -> Result<ProxyEndpoint> {
    let port: i32 = row.try_get("port")?;
    let last_test: Option<serde_json::Value> = row.try_get("last_test_result")?;
    Ok(ProxyEndpoint {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: u16::try_from(port).context("proxy port out of range")?,
        username: row.try_get("username")?,
        password: row.try_get("password")?,
        enabled: row.try_get("enabled")?,
        regions: row.try_get("regions")?,
        last_test_result: last_test.and_then(|v| serde_json::from_value(v).ok()),
    })
}

#[async_trait]
impl TrackingStore for PgStore {
    async fn load_due_jobs(&self, limit: usize) -> Result<DueJobs> {
        // SKIP LOCKED + lease: concurrent schedulers never claim the same job.
        let sql = format!(
            r#"
            UPDATE tracking_jobs SET claimed_until = NOW() + make_interval(secs => $2), claimed_by = $3
            WHERE id IN (
                SELECT id FROM tracking_jobs
                WHERE status = 'active'
                  AND (next_run_at IS NULL OR next_run_at <= NOW())
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY next_run_at ASC NULLS FIRST
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(self.claim_lease.as_secs_f64())
            .bind(self.instance_id)
            .fetch_all(&self.pool)
            .await?;

        let mut due = DueJobs::default();
        for row in &rows {
            match job_from_row(row) {
                Ok(job) => due.jobs.push(job),
                Err(e) => match (row.try_get::<Uuid, _>("id"), row.try_get::<Uuid, _>("user_id")) {
                    (Ok(job_id), Ok(user_scope)) => due.unreadable.push(UnreadableJob {
                        job_id,
                        user_scope,
                        reason: format!("{:#}", e),
                    }),
                    _ => warn!("⚠️ [Store] Claimed a job row without usable ids: {:#}", e),
                },
            }
        }
        Ok(due)
    }

    async fn renew_claim(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE tracking_jobs SET claimed_until = NOW() + make_interval(secs => $3) WHERE id = $1 AND claimed_by = $2 AND status = 'active'"
        )
        .bind(job_id)
        .bind(self.instance_id)
        .bind(self.claim_lease.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<TrackingJob>> {
        let sql = format!("SELECT {} FROM tracking_jobs WHERE id = $1", JOB_COLUMNS);
        let row = sqlx::query(&sql).bind(job_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn append_position_sample(&self, job_id: Uuid, keyword: &str, sample: &PositionSample) -> Result<()> {
        sqlx::query(
            "INSERT INTO position_history (tracking_job_id, keyword, organic_position, sponsored_position, search_volume, competition_level, tracked_at) VALUES ($1, $2, $3, $4, $5, $6, $7)"
        )
        .bind(job_id)
        .bind(keyword)
        .bind(sample.organic_position.map(|v| v as i32))
        .bind(sample.sponsored_position.map(|v| v as i32))
        .bind(sample.search_volume_estimate.map(|v| v as i32))
        .bind(sample.competition_level.as_str())
        .bind(sample.tracked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_sample(&self, job_id: Uuid, keyword: &str) -> Result<Option<PositionSample>> {
        let sql = format!(
            "SELECT {} FROM position_history WHERE tracking_job_id = $1 AND keyword = $2 ORDER BY tracked_at DESC LIMIT 1",
            SAMPLE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(keyword)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(sample_from_row).transpose()
    }

    async fn load_history(&self, job_id: Uuid, keyword: &str, since: DateTime<Utc>) -> Result<Vec<PositionSample>> {
        let sql = format!(
            "SELECT {} FROM position_history WHERE tracking_job_id = $1 AND keyword = $2 AND tracked_at >= $3 ORDER BY tracked_at ASC",
            SAMPLE_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .bind(keyword)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sample_from_row).collect()
    }

    async fn update_job_schedule(
        &self,
        job_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        status: JobStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tracking_jobs SET last_run_at = $2, next_run_at = $3, status = $4, claimed_until = NULL, claimed_by = NULL WHERE id = $1"
        )
        .bind(job_id)
        .bind(last_run_at)
        .bind(next_run_at)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_enabled_proxies(&self, user_scope: Uuid) -> Result<Vec<ProxyEndpoint>> {
        let rows = sqlx::query(
            "SELECT id, host, port, username, password, enabled, regions, last_test_result FROM proxy_configurations WHERE user_id = $1 AND enabled ORDER BY id"
        )
        .bind(user_scope)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(proxy_from_row).collect()
    }

    async fn record_proxy_test(&self, proxy_id: &str, result: &ProxyTestResult) -> Result<()> {
        sqlx::query("UPDATE proxy_configurations SET last_test_result = $2, updated_at = NOW() WHERE id = $1")
            .bind(proxy_id)
            .bind(sqlx::types::Json(result))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_request(&self, entry: &RequestLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO api_requests (tracking_job_id, user_id, keyword, marketplace, success, error_message, user_agent, response_time_ms, data_used, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        )
        .bind(entry.job_id)
        .bind(entry.user_scope)
        .bind(&entry.keyword)
        .bind(entry.marketplace.code())
        .bind(entry.success)
        .bind(entry.error_message.as_deref())
        .bind(entry.user_agent.as_deref())
        .bind(entry.response_time_ms as i64)
        .bind(entry.data_used as i64)
        .bind(entry.requested_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_requests(&self, user_scope: Uuid, since: DateTime<Utc>) -> Result<Vec<RequestLogEntry>> {
        let rows = sqlx::query(
            "SELECT tracking_job_id, user_id, keyword, marketplace, success, error_message, user_agent, response_time_ms, data_used, created_at FROM api_requests WHERE user_id = $1 AND tracking_job_id IS NOT NULL AND created_at >= $2 ORDER BY created_at ASC"
        )
        .bind(user_scope)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(request_from_row).collect()
    }
}
