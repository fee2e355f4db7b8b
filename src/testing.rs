//! In-memory doubles for the store, notifier and network, plus a builder for
//! search result pages.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::models::{
    JobStatus, Marketplace, NotificationKind, PositionSample, TrackingFrequency, TrackingJob,
};
use crate::notify::Notifier;
use crate::proxy::{ProxyEndpoint, ProxyTestResult};
use crate::store::{DueJobs, RequestLogEntry, TrackingStore, UnreadableJob};
use crate::transport::{OutboundRequest, RawResponse, Transport, TransportError};

pub const TARGET: &str = "B08N5WRWNW";

pub fn proxy(id: &str) -> ProxyEndpoint {
    ProxyEndpoint {
        id: id.to_string(),
        host: "127.0.0.1".to_string(),
        port: 8080,
        username: None,
        password: None,
        enabled: true,
        regions: Vec::new(),
        last_test_result: None,
    }
}

pub fn job(keywords: &[&str]) -> TrackingJob {
    TrackingJob {
        id: Uuid::new_v4(),
        user_scope: Uuid::new_v4(),
        target_id: TARGET.to_string(),
        marketplace: Marketplace::US,
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        frequency: TrackingFrequency::Daily,
        delay_range_secs: (2, 8),
        status: JobStatus::Active,
        last_run_at: None,
        next_run_at: None,
    }
}

// ============================================================================
// Transport
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: String,
    pub proxy_id: Option<String>,
    pub cookie: Option<String>,
    pub user_agent: Option<String>,
    pub timeout: Duration,
}

/// Replays canned responses in order. Runs dry with a network error.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn page(status: u16, body: &str) -> RawResponse {
        RawResponse {
            status,
            body: body.to_string(),
            set_cookies: Vec::new(),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, request: OutboundRequest<'_>) -> Result<RawResponse, TransportError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            url: request.url.to_string(),
            proxy_id: request.proxy.map(|p| p.id.clone()),
            cookie: request.cookie.map(str::to_string),
            user_agent: request
                .headers
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
                .map(|(_, v)| v.clone()),
            timeout: request.timeout,
        });
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("script exhausted".to_string())))
    }
}

// ============================================================================
// Result pages
// ============================================================================

pub struct Item {
    id: String,
    sponsored: bool,
}

impl Item {
    pub fn organic(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sponsored: false,
        }
    }

    pub fn sponsored(id: &str) -> Self {
        Self {
            id: id.to_string(),
            sponsored: true,
        }
    }
}

pub fn results_page(items: &[Item], banner: Option<&str>) -> String {
    let mut html = String::from("<html><head><title>Amazon.com</title></head><body>");
    if let Some(banner) = banner {
        html.push_str(&format!(
            r#"<div data-component-type="s-result-info-bar"><span>{}</span></div>"#,
            banner
        ));
    }
    html.push_str(r#"<div class="s-main-slot">"#);
    for item in items {
        if item.sponsored {
            html.push_str(&format!(
                r#"<div data-asin="{id}" data-component-type="s-search-result" class="s-result-item AdHolder"><span class="puis-sponsored-label-text">Sponsored</span><h2>Item {id}</h2></div>"#,
                id = item.id
            ));
        } else {
            html.push_str(&format!(
                r#"<div data-asin="{id}" data-component-type="s-search-result" class="s-result-item"><h2>Item {id}</h2></div>"#,
                id = item.id
            ));
        }
    }
    html.push_str("</div></body></html>");
    html
}

/// Page with the target as the `position`-th organic result.
pub fn page_with_target_at(position: usize) -> String {
    let mut items: Vec<Item> = (1..position).map(|i| Item::organic(&format!("A{}", i))).collect();
    items.push(Item::organic(TARGET));
    items.push(Item::sponsored("S1"));
    results_page(&items, Some("1-48 of over 60,000 results"))
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
struct MemoryState {
    jobs: Vec<TrackingJob>,
    samples: Vec<(Uuid, String, PositionSample)>,
    proxies: Vec<(Uuid, ProxyEndpoint)>,
    proxy_tests: Vec<(String, ProxyTestResult)>,
    proxy_loads: usize,
    requests: Vec<RequestLogEntry>,
    claimed: HashSet<Uuid>,
    /// Renewal fails for these, as if another instance took them over.
    lost_claims: HashSet<Uuid>,
    /// Claimed rows whose contents cannot be read back.
    unreadable: HashSet<Uuid>,
    failing_appends: HashSet<Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn with_jobs(jobs: Vec<TrackingJob>) -> Self {
        let store = Self::default();
        store.state.lock().unwrap().jobs = jobs;
        store
    }

    pub fn add_proxy(&self, user_scope: Uuid, endpoint: ProxyEndpoint) {
        self.state.lock().unwrap().proxies.push((user_scope, endpoint));
    }

    pub fn fail_appends_for(&self, job_id: Uuid) {
        self.state.lock().unwrap().failing_appends.insert(job_id);
    }

    pub fn lose_claim(&self, job_id: Uuid) {
        self.state.lock().unwrap().lost_claims.insert(job_id);
    }

    pub fn mark_unreadable(&self, job_id: Uuid) {
        self.state.lock().unwrap().unreadable.insert(job_id);
    }

    pub fn requests(&self) -> Vec<RequestLogEntry> {
        self.state.lock().unwrap().requests.clone()
    }

    /// Pull the job's next run into the past so the next cycle picks it up.
    pub fn make_due(&self, job_id: Uuid) {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == job_id) {
            job.next_run_at = job.last_run_at;
        }
    }

    pub fn job(&self, job_id: Uuid) -> TrackingJob {
        self.state
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
            .expect("job exists")
    }

    pub fn samples_for(&self, job_id: Uuid) -> Vec<(String, PositionSample)> {
        self.state
            .lock()
            .unwrap()
            .samples
            .iter()
            .filter(|(id, _, _)| *id == job_id)
            .map(|(_, kw, s)| (kw.clone(), s.clone()))
            .collect()
    }

    pub fn proxy_loads(&self) -> usize {
        self.state.lock().unwrap().proxy_loads
    }

    pub fn proxy_tests(&self) -> Vec<(String, ProxyTestResult)> {
        self.state.lock().unwrap().proxy_tests.clone()
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn load_due_jobs(&self, limit: usize) -> Result<DueJobs> {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        let mut due: Vec<TrackingJob> = state
            .jobs
            .iter()
            .filter(|j| j.is_due(now) && !state.claimed.contains(&j.id))
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run_at);
        due.truncate(limit);
        state.claimed.extend(due.iter().map(|j| j.id));

        let (unreadable, jobs): (Vec<_>, Vec<_>) = due.into_iter().partition(|j| state.unreadable.contains(&j.id));
        Ok(DueJobs {
            jobs,
            unreadable: unreadable
                .into_iter()
                .map(|j| UnreadableJob {
                    job_id: j.id,
                    user_scope: j.user_scope,
                    reason: "unknown tracking frequency 'fortnightly'".to_string(),
                })
                .collect(),
        })
    }

    async fn renew_claim(&self, job_id: Uuid) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.claimed.contains(&job_id) && !state.lost_claims.contains(&job_id))
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Option<TrackingJob>> {
        Ok(self.state.lock().unwrap().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn append_position_sample(&self, job_id: Uuid, keyword: &str, sample: &PositionSample) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_appends.contains(&job_id) {
            return Err(anyhow!("connection reset while writing position_history"));
        }
        state.samples.push((job_id, keyword.to_string(), sample.clone()));
        Ok(())
    }

    async fn latest_sample(&self, job_id: Uuid, keyword: &str) -> Result<Option<PositionSample>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .samples
            .iter()
            .filter(|(id, kw, _)| *id == job_id && kw == keyword)
            .max_by_key(|(_, _, s)| s.tracked_at)
            .map(|(_, _, s)| s.clone()))
    }

    async fn load_history(&self, job_id: Uuid, keyword: &str, since: DateTime<Utc>) -> Result<Vec<PositionSample>> {
        let mut history: Vec<PositionSample> = self
            .state
            .lock()
            .unwrap()
            .samples
            .iter()
            .filter(|(id, kw, s)| *id == job_id && kw == keyword && s.tracked_at >= since)
            .map(|(_, _, s)| s.clone())
            .collect();
        history.sort_by_key(|s| s.tracked_at);
        Ok(history)
    }

    async fn update_job_schedule(
        &self,
        job_id: Uuid,
        last_run_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        status: JobStatus,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.claimed.remove(&job_id);
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| anyhow!("no job {}", job_id))?;
        job.last_run_at = Some(last_run_at);
        job.next_run_at = next_run_at;
        job.status = status;
        Ok(())
    }

    async fn load_enabled_proxies(&self, user_scope: Uuid) -> Result<Vec<ProxyEndpoint>> {
        let mut state = self.state.lock().unwrap();
        state.proxy_loads += 1;
        Ok(state
            .proxies
            .iter()
            .filter(|(scope, p)| *scope == user_scope && p.enabled)
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn record_proxy_test(&self, proxy_id: &str, result: &ProxyTestResult) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .proxy_tests
            .push((proxy_id.to_string(), result.clone()));
        Ok(())
    }

    async fn record_request(&self, entry: &RequestLogEntry) -> Result<()> {
        self.state.lock().unwrap().requests.push(entry.clone());
        Ok(())
    }

    async fn load_requests(&self, user_scope: Uuid, since: DateTime<Utc>) -> Result<Vec<RequestLogEntry>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .requests
            .iter()
            .filter(|r| r.user_scope == user_scope && r.requested_at >= since)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Notifier
// ============================================================================

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, NotificationKind, Value)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(Uuid, NotificationKind, Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user_scope: Uuid, kind: NotificationKind, payload: Value) {
        self.events.lock().unwrap().push((user_scope, kind, payload));
    }
}
