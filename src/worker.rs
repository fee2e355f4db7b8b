//! Runs one tracking job: every keyword is fetched, parsed and appended to
//! the job's history, failures included.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::executor::{FetchOutcome, RequestExecutor};
use crate::models::{CompetitionLevel, PositionSample, TrackingJob};
use crate::parser::ResultParser;
use crate::store::{RequestLogEntry, TrackingStore};
use crate::trend::{Trend, TrendAnalyzer};

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeywordResult {
    pub keyword: String,
    /// False when every fetch attempt failed and a gap sample was written.
    pub fetched: bool,
    pub organic_position: Option<u32>,
    pub sponsored_position: Option<u32>,
    pub search_volume: Option<u32>,
    pub competition_level: CompetitionLevel,
    pub trend: Trend,
    pub tracked_at: DateTime<Utc>,
}

impl KeywordResult {
    fn new(keyword: &str, fetched: bool, sample: &PositionSample, trend: Trend) -> Self {
        Self {
            keyword: keyword.to_string(),
            fetched,
            organic_position: sample.organic_position,
            sponsored_position: sample.sponsored_position,
            search_volume: sample.search_volume_estimate,
            competition_level: sample.competition_level,
            trend,
            tracked_at: sample.tracked_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub results: Vec<KeywordResult>,
}

#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobReport),
    /// Shutdown arrived between keywords; the job must not be rescheduled.
    Interrupted,
}

/// Collaborators shared by every job of a cycle.
pub struct JobContext<'a> {
    pub store: &'a dyn TrackingStore,
    pub parser: &'a ResultParser,
    pub trends: &'a TrendAnalyzer,
    pub shutdown: &'a CancellationToken,
}

/// Errors returned here are job-level failures. Keyword-level fetch
/// failures are recorded as gap samples and never surface as `Err`.
pub async fn process_job(
    ctx: &JobContext<'_>,
    job: &TrackingJob,
    executor: &mut RequestExecutor,
    rng: &mut StdRng,
) -> Result<JobOutcome> {
    let keywords = job.unique_keywords();
    info!(
        "🚀 [Worker] Processing job {} ({}) on {}: {} keywords",
        job.id,
        job.target_id,
        job.marketplace,
        keywords.len()
    );

    let mut results = Vec::with_capacity(keywords.len());
    for keyword in keywords {
        if ctx.shutdown.is_cancelled() {
            return Ok(JobOutcome::Interrupted);
        }

        let (min, max) = job.delay_range_secs;
        let delay = Duration::from_secs(rng.gen_range(min..=max.max(min)));
        tokio::select! {
            _ = sleep(delay) => {}
            _ = ctx.shutdown.cancelled() => return Ok(JobOutcome::Interrupted),
        }

        let url = job.marketplace.search_url(keyword);
        let started = Instant::now();
        let outcome = executor.fetch(&url).await?;
        let response_time_ms = started.elapsed().as_millis() as u64;
        let tracked_at = Utc::now();

        let (sample, failure, data_used) = match outcome {
            FetchOutcome::Success(body) => {
                let parsed = ctx.parser.parse(&body, &job.target_id);
                (parsed.into_sample(tracked_at), None, body.len() as u64)
            }
            FetchOutcome::Blocked(reason) => {
                warn!("🚫 [Worker] '{}' for job {} stayed blocked: {}", keyword, job.id, reason);
                (PositionSample::failed(tracked_at), Some(format!("blocked: {}", reason)), 0)
            }
            FetchOutcome::TransientError(cause) => {
                warn!("⚠️ [Worker] '{}' for job {} failed: {}", keyword, job.id, cause);
                (PositionSample::failed(tracked_at), Some(cause), 0)
            }
        };
        let fetched = failure.is_none();

        let entry = RequestLogEntry {
            job_id: job.id,
            user_scope: job.user_scope,
            keyword: keyword.to_string(),
            marketplace: job.marketplace,
            success: fetched,
            error_message: failure,
            user_agent: executor.last_user_agent().map(str::to_string),
            response_time_ms,
            data_used,
            requested_at: tracked_at,
        };
        // Usage accounting is best effort; it never fails the job.
        if let Err(e) = ctx.store.record_request(&entry).await {
            warn!("⚠️ [Worker] Could not log request for '{}' (job {}): {:#}", keyword, job.id, e);
        }

        let previous = ctx.store.latest_sample(job.id, keyword).await?;
        let trend = ctx.trends.classify(previous.as_ref(), &sample);
        ctx.store.append_position_sample(job.id, keyword, &sample).await?;

        info!(
            "📈 [Worker] '{}' -> organic={:?} sponsored={:?} trend={}",
            keyword,
            sample.organic_position,
            sample.sponsored_position,
            trend.as_str()
        );
        results.push(KeywordResult::new(keyword, fetched, &sample, trend));
    }

    Ok(JobOutcome::Completed(JobReport { results }))
}
