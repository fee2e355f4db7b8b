use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{JobStatus, Marketplace, PositionSample, TrackingJob};
use crate::proxy::{ProxyEndpoint, ProxyTestResult};

/// A claimed row that could not be turned into a `TrackingJob`.
#[derive(Debug, Clone)]
pub struct UnreadableJob {
    pub job_id: Uuid,
    pub user_scope: Uuid,
    pub reason: String,
}

/// Jobs claimed by one `load_due_jobs` call.
#[derive(Debug, Clone, Default)]
pub struct DueJobs {
    pub jobs: Vec<TrackingJob>,
    /// Claimed but malformed; the caller must fail them so they stop coming back.
    pub unreadable: Vec<UnreadableJob>,
}

impl DueJobs {
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty() && self.unreadable.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len() + self.unreadable.len()
    }
}

/// One keyword search as sent upstream, kept for usage accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestLogEntry {
    pub job_id: Uuid,
    pub user_scope: Uuid,
    pub keyword: String,
    pub marketplace: Marketplace,
    pub success: bool,
    pub error_message: Option<String>,
    pub user_agent: Option<String>,
    pub response_time_ms: u64,
    /// Body bytes received; zero when nothing usable came back.
    pub data_used: u64,
    pub requested_at: DateTime<Utc>,
}

/// Persistence the tracker depends on. Jobs and proxies are created and
/// edited elsewhere; the tracker only claims, reschedules and appends.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Active jobs whose `next_run_at` is unset or in the past, at most `limit`.
    /// Returned jobs are claimed by this store instance until rescheduled or
    /// until the lease runs out.
    async fn load_due_jobs(&self, limit: usize) -> Result<DueJobs>;

    /// Extend this instance's claim on `job_id`. `false` when the claim was
    /// lost (lease expired and someone else took the job, or it was
    /// rescheduled meanwhile).
    async fn renew_claim(&self, job_id: Uuid) -> Result<bool>;

    async fn load_job(&self, job_id: Uuid) -> Result<Option<TrackingJob>>;

    async fn append_position_sample(&self, job_id: Uuid, keyword: &str, sample: &PositionSample) -> Result<()>;

    async fn latest_sample(&self, job_id: Uuid, keyword: &str) -> Result<Option<PositionSample>>;

    /// Samples tracked at or after `since`, oldest first.
    async fn load_history(&self, job_id: Uuid, keyword: &str, since: DateTime<Utc>) -> Result<Vec<PositionSample>>;

    async fn update_job_schedule(
        &self,
        job_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        status: JobStatus,
    ) -> Result<()>;

    async fn load_enabled_proxies(&self, user_scope: Uuid) -> Result<Vec<ProxyEndpoint>>;

    async fn record_proxy_test(&self, proxy_id: &str, result: &ProxyTestResult) -> Result<()>;

    async fn record_request(&self, entry: &RequestLogEntry) -> Result<()>;

    /// A user's requests made at or after `since`.
    async fn load_requests(&self, user_scope: Uuid, since: DateTime<Utc>) -> Result<Vec<RequestLogEntry>>;
}
