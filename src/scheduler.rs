use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler as CronScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::executor::{ExecutorConfig, ExecutorStats, RequestExecutor};
use crate::identity::{IdentityConfig, IdentityRotator};
use crate::models::{next_due_time, JobStatus, NotificationKind, TrackingJob};
use crate::notify::Notifier;
use crate::parser::{ParserConfig, ResultParser};
use crate::proxy::ProxyPool;
use crate::session::{SessionConfig, SessionState};
use crate::store::{TrackingStore, UnreadableJob};
use crate::transport::Transport;
use crate::trend::{TrendAnalyzer, TrendConfig};
use crate::worker::{process_job, JobContext, JobOutcome, JobReport};

const HEARTBEAT_CRON: &str = "0 */5 * * * *";

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Most jobs handled per cycle; the rest stay due.
    pub batch_size: usize,
    pub inter_job_delay_secs: (u64, u64),
    /// How long a claimed job is hidden from other scheduler instances.
    pub claim_lease: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            inter_job_delay_secs: (5, 15),
            claim_lease: Duration::from_secs(3600),
        }
    }
}

/// Settings for everything a cycle builds per job.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub identity: IdentityConfig,
    pub session: SessionConfig,
    pub executor: ExecutorConfig,
    pub parser: ParserConfig,
    pub trend: TrendConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Default, Serialize, ToSchema)]
pub struct CycleReport {
    /// Jobs that reached a final state this cycle.
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    /// Claimed jobs left alone because the claim could not be renewed.
    pub skipped: usize,
    /// Shutdown cut the cycle short.
    pub interrupted: bool,
    pub stats: ExecutorStats,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("a tracking cycle is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub struct JobScheduler {
    store: Arc<dyn TrackingStore>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn Transport>,
    identities: IdentityRotator,
    parser: ResultParser,
    trends: TrendAnalyzer,
    config: EngineConfig,
    /// Held for the whole cycle: one cycle per process at a time.
    cycle: Mutex<StdRng>,
    shutdown: CancellationToken,
}

impl JobScheduler {
    pub fn new(
        store: Arc<dyn TrackingStore>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        rng: StdRng,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            notifier,
            transport,
            identities: IdentityRotator::new(config.identity.clone()),
            parser: ResultParser::new(config.parser.clone()),
            trends: TrendAnalyzer::new(config.trend.clone()),
            config,
            cycle: Mutex::new(rng),
            shutdown,
        }
    }

    pub fn trends(&self) -> &TrendAnalyzer {
        &self.trends
    }

    pub fn is_running(&self) -> bool {
        self.cycle.try_lock().is_err()
    }

    /// Resolves once no cycle holds the lock.
    pub async fn wait_idle(&self) {
        let _idle = self.cycle.lock().await;
    }

    /// One pass over the due jobs. Per-job errors are absorbed into the
    /// report; only failing to load the batch is an error.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let Ok(mut rng) = self.cycle.try_lock() else {
            return Err(CycleError::AlreadyRunning);
        };
        let mut report = CycleReport::default();
        if self.shutdown.is_cancelled() {
            report.interrupted = true;
            return Ok(report);
        }

        let due = self.store.load_due_jobs(self.config.scheduler.batch_size).await?;
        if due.is_empty() {
            info!("💤 [Scheduler] No jobs due");
            return Ok(report);
        }
        info!("⏰ [Scheduler] Cycle started with {} due jobs", due.len());

        for unreadable in &due.unreadable {
            self.fail_unreadable(unreadable).await;
            report.failed += 1;
            report.processed += 1;
        }

        let mut jobs = due.jobs;
        let pools = self.load_proxy_pools(&jobs).await;
        jobs.shuffle(&mut *rng);

        let ctx = JobContext {
            store: self.store.as_ref(),
            parser: &self.parser,
            trends: &self.trends,
            shutdown: &self.shutdown,
        };

        let total = jobs.len();
        for (idx, job) in jobs.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                report.interrupted = true;
                break;
            }

            // One lease covers the whole batch; extend it per job.
            match self.store.renew_claim(job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("⏭️ [Scheduler] Claim on job {} was lost, leaving it to its new owner", job.id);
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!("❌ [Scheduler] Could not renew claim on job {}: {:#}", job.id, e);
                    report.skipped += 1;
                    continue;
                }
            }

            let pool = pools
                .get(&job.user_scope)
                .map(|p| p.for_region(job.marketplace.code()))
                .unwrap_or_default();
            if pool.is_empty() {
                warn!("⚠️ [Scheduler] No usable proxy for job {}, fetching direct (degraded mode)", job.id);
            }

            let mut executor = RequestExecutor::new(
                self.transport.clone(),
                self.identities.clone(),
                pool,
                SessionState::new(&self.config.session),
                self.config.executor.clone(),
                StdRng::seed_from_u64(rng.gen()),
            );
            let result = process_job(&ctx, job, &mut executor, &mut rng).await;
            report.stats.merge(&executor.stats());

            match result {
                Ok(JobOutcome::Completed(job_report)) => match self.complete_job(job, &job_report).await {
                    Ok(()) => report.successful += 1,
                    Err(e) => {
                        self.fail_job(job, &e).await;
                        report.failed += 1;
                    }
                },
                Ok(JobOutcome::Interrupted) => {
                    warn!("🛑 [Scheduler] Shutdown requested, leaving job {} due", job.id);
                    report.interrupted = true;
                    break;
                }
                Err(e) => {
                    self.fail_job(job, &e).await;
                    report.failed += 1;
                }
            }
            report.processed += 1;

            if idx + 1 < total {
                let (min, max) = self.config.scheduler.inter_job_delay_secs;
                let delay = Duration::from_secs(rng.gen_range(min..=max.max(min)));
                let cancelled = tokio::select! {
                    _ = sleep(delay) => false,
                    _ = self.shutdown.cancelled() => true,
                };
                if cancelled {
                    report.interrupted = true;
                    break;
                }
            }
        }

        info!(
            "✅ [Scheduler] Cycle finished: {} processed, {} ok, {} failed, {} skipped, {} attempts ({} blocked)",
            report.processed,
            report.successful,
            report.failed,
            report.skipped,
            report.stats.attempts,
            report.stats.blocked
        );
        Ok(report)
    }

    /// One lookup per user scope per cycle. A failed lookup degrades that
    /// scope to direct fetching.
    async fn load_proxy_pools(&self, jobs: &[TrackingJob]) -> HashMap<Uuid, ProxyPool> {
        let mut pools = HashMap::new();
        for job in jobs {
            if pools.contains_key(&job.user_scope) {
                continue;
            }
            let pool = match self.store.load_enabled_proxies(job.user_scope).await {
                Ok(endpoints) => ProxyPool::new(endpoints),
                Err(e) => {
                    error!("❌ [Scheduler] Could not load proxies for user {}: {:#}", job.user_scope, e);
                    ProxyPool::empty()
                }
            };
            pools.insert(job.user_scope, pool);
        }
        pools
    }

    async fn complete_job(&self, job: &TrackingJob, job_report: &JobReport) -> anyhow::Result<()> {
        let now = Utc::now();
        let next = next_due_time(job.frequency, now);
        self.store
            .update_job_schedule(job.id, now, Some(next), JobStatus::Active)
            .await?;
        info!("✅ [Scheduler] Job {} done, next run at {}", job.id, next);

        self.notifier
            .notify(
                job.user_scope,
                NotificationKind::TrackingComplete,
                json!({
                    "jobId": job.id,
                    "jobName": job.display_name(),
                    "asin": job.target_id,
                    "marketplace": job.marketplace.code(),
                    "keywords": job.keywords,
                    "results": job_report.results,
                }),
            )
            .await;
        Ok(())
    }

    async fn fail_job(&self, job: &TrackingJob, cause: &anyhow::Error) {
        error!("❌ [Scheduler] Job {} failed: {:#}", job.id, cause);
        if let Err(e) = self
            .store
            .update_job_schedule(job.id, Utc::now(), None, JobStatus::Failed)
            .await
        {
            error!("🔥 [Scheduler] Could not mark job {} failed: {:#}", job.id, e);
        }
        self.notifier
            .notify(
                job.user_scope,
                NotificationKind::TrackingFailed,
                json!({
                    "jobId": job.id,
                    "jobName": job.display_name(),
                    "keywords": job.keywords,
                    "error": format!("{:#}", cause),
                }),
            )
            .await;
    }

    /// A claimed row that cannot be read would be claimed again on every
    /// lease expiry; fail it so someone fixes it.
    async fn fail_unreadable(&self, job: &UnreadableJob) {
        error!("❌ [Scheduler] Job {} is unreadable: {}", job.job_id, job.reason);
        if let Err(e) = self
            .store
            .update_job_schedule(job.job_id, Utc::now(), None, JobStatus::Failed)
            .await
        {
            error!("🔥 [Scheduler] Could not mark job {} failed: {:#}", job.job_id, e);
        }
        self.notifier
            .notify(
                job.user_scope,
                NotificationKind::TrackingFailed,
                json!({
                    "jobId": job.job_id,
                    "error": format!("job configuration unreadable: {}", job.reason),
                }),
            )
            .await;
    }
}

/// Registers the heartbeat and the tracking cycle on a cron scheduler and
/// starts it. Ticks that land while a cycle runs are skipped.
pub async fn start_scheduler(scheduler: Arc<JobScheduler>, cycle_cron: &str) -> anyhow::Result<CronScheduler> {
    let sched = CronScheduler::new().await?;

    sched
        .add(CronJob::new_async(HEARTBEAT_CRON, |_uuid, _l| {
            Box::pin(async move {
                info!("⏰ [Scheduler] Heartbeat: rank tracker active.");
            })
        })?)
        .await?;

    let cycle_scheduler = scheduler.clone();
    sched
        .add(CronJob::new_async(cycle_cron, move |_uuid, _l| {
            let scheduler = cycle_scheduler.clone();
            Box::pin(async move {
                match scheduler.run_cycle().await {
                    Ok(_) => {}
                    Err(CycleError::AlreadyRunning) => {
                        info!("⏭️ [Scheduler] Previous cycle still running, skipping tick");
                    }
                    Err(e) => error!("❌ [Scheduler] Cycle aborted: {:#}", e),
                }
            })
        })?)
        .await?;

    sched.start().await?;
    info!("✅ Tracking scheduler started (cron '{}')", cycle_cron);
    Ok(sched)
}
