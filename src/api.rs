use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::proxy::{test_endpoint, ProxyEndpoint, ProxyTestConfig, ProxyTestResult};
use crate::scheduler::{CycleError, JobScheduler};
use crate::store::TrackingStore;
use crate::transport::Transport;
use crate::trend::{KeywordAnalytics, TrendAnalyzer, TrendSummary};
use crate::usage::{summarize_usage, usage_window_start, UsageStats};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TrackingStore>,
    pub scheduler: Arc<JobScheduler>,
    pub transport: Arc<dyn Transport>,
    pub proxy_test: ProxyTestConfig,
}

type ApiError = (StatusCode, String);

fn internal(e: anyhow::Error) -> ApiError {
    error!("❌ [API] {:#}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub cycle_running: bool,
}

#[utoipa::path(
    get,
    path = "/health",
    tag = "tracker",
    responses((status = 200, description = "Service is up", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        cycle_running: state.scheduler.is_running(),
    })
}

#[derive(Serialize, ToSchema)]
pub struct CycleResponse {
    pub message: String,
}

/// Starts a tracking cycle in the background.
#[utoipa::path(
    post,
    path = "/cycle",
    tag = "tracker",
    responses(
        (status = 202, description = "Cycle started", body = CycleResponse),
        (status = 409, description = "A cycle is already running", body = CycleResponse)
    )
)]
pub async fn trigger_cycle(State(state): State<Arc<AppState>>) -> (StatusCode, Json<CycleResponse>) {
    if state.scheduler.is_running() {
        return (
            StatusCode::CONFLICT,
            Json(CycleResponse {
                message: CycleError::AlreadyRunning.to_string(),
            }),
        );
    }

    let scheduler = state.scheduler.clone();
    tokio::spawn(async move {
        match scheduler.run_cycle().await {
            Ok(report) => info!("✅ [API] Manual cycle finished: {} jobs", report.processed),
            Err(e) => error!("❌ [API] Manual cycle failed: {}", e),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(CycleResponse {
            message: "Cycle started".to_string(),
        }),
    )
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobAnalytics {
    pub job_id: Uuid,
    pub job_name: String,
    pub keywords: Vec<KeywordAnalytics>,
    pub summary: TrendSummary,
}

#[utoipa::path(
    get,
    path = "/jobs/{id}/analytics",
    tag = "tracker",
    params(("id" = Uuid, Path, description = "Tracking job id")),
    responses(
        (status = 200, description = "Per-keyword ranking analytics", body = JobAnalytics),
        (status = 404, description = "Unknown job")
    )
)]
pub async fn job_analytics(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobAnalytics>, ApiError> {
    let job = state
        .store
        .load_job(job_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("job {} not found", job_id)))?;

    let analyzer = state.scheduler.trends();
    let now = Utc::now();
    let since = now - Duration::days(analyzer.config().history_window_days);

    let mut keywords = Vec::new();
    for keyword in job.unique_keywords() {
        let history = state
            .store
            .load_history(job.id, keyword, since)
            .await
            .map_err(internal)?;
        if let Some(analytics) = analyzer.analyze(keyword, &history, now) {
            keywords.push(analytics);
        }
    }

    Ok(Json(JobAnalytics {
        job_id: job.id,
        job_name: job.display_name(),
        summary: TrendAnalyzer::summarize(&keywords),
        keywords,
    }))
}

/// Request volume and bytes received for a user over the last 30 days.
#[utoipa::path(
    get,
    path = "/users/{id}/usage",
    tag = "tracker",
    params(("id" = Uuid, Path, description = "User scope")),
    responses((status = 200, description = "Usage counters", body = UsageStats))
)]
pub async fn usage_stats(
    State(state): State<Arc<AppState>>,
    Path(user_scope): Path<Uuid>,
) -> Result<Json<UsageStats>, ApiError> {
    let now = Utc::now();
    let requests = state
        .store
        .load_requests(user_scope, usage_window_start(now))
        .await
        .map_err(internal)?;
    Ok(Json(summarize_usage(&requests, now)))
}

#[derive(Deserialize, ToSchema)]
pub struct ProxyTestRequest {
    /// When set, the result is stored as the endpoint's last test result.
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[utoipa::path(
    post,
    path = "/proxies/test",
    tag = "proxy",
    request_body = ProxyTestRequest,
    responses((status = 200, description = "Connectivity test result", body = ProxyTestResult))
)]
pub async fn test_proxy(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ProxyTestRequest>,
) -> Json<ProxyTestResult> {
    let endpoint = ProxyEndpoint {
        id: payload.id.clone().unwrap_or_else(|| format!("{}:{}", payload.host, payload.port)),
        host: payload.host,
        port: payload.port,
        username: payload.username,
        password: payload.password,
        enabled: true,
        regions: Vec::new(),
        last_test_result: None,
    };

    let result = test_endpoint(state.transport.as_ref(), &endpoint, &state.proxy_test).await;
    if let Some(id) = payload.id {
        if let Err(e) = state.store.record_proxy_test(&id, &result).await {
            error!("❌ [API] Could not store test result for proxy {}: {:#}", id, e);
        }
    }
    Json(result)
}
