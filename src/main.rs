mod api;
mod config;
mod db;
mod executor;
mod identity;
mod models;
mod notify;
mod parser;
mod proxy;
mod scheduler;
mod session;
mod store;
mod transport;
mod trend;
mod usage;
mod worker;

#[cfg(test)]
mod testing;

use axum::{
    routing::{get, post},
    Router,
};
use dotenv::dotenv;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::config::AppConfig;
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::scheduler::JobScheduler;
use crate::transport::ReqwestTransport;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health,
        api::trigger_cycle,
        api::job_analytics,
        api::usage_stats,
        api::test_proxy
    ),
    components(
        schemas(
            api::HealthResponse,
            api::CycleResponse,
            api::JobAnalytics,
            api::ProxyTestRequest,
            crate::trend::KeywordAnalytics,
            crate::trend::TrendSummary,
            crate::trend::Trend,
            crate::usage::UsageStats,
            crate::usage::MarketplaceUsage,
            crate::proxy::ProxyTestResult
        )
    ),
    tags(
        (name = "tracker", description = "Rank Tracking API"),
        (name = "proxy", description = "Proxy Diagnostics API")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;

    let pool = db::connect_with_retry(&config.database_url).await?;
    db::init_db(&pool).await?;
    let store = Arc::new(db::PgStore::new(pool, config.scheduler.claim_lease));

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())?),
        None => {
            warn!("⚠️ NOTIFY_WEBHOOK_URL not set, notifications go to the log only");
            Arc::new(LogNotifier)
        }
    };
    let transport = Arc::new(ReqwestTransport::new()?);
    let rng = match config.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let shutdown = CancellationToken::new();
    let scheduler = Arc::new(JobScheduler::new(
        store.clone(),
        notifier,
        transport.clone(),
        config.engine(),
        rng,
        shutdown.clone(),
    ));

    let mut cron = scheduler::start_scheduler(scheduler.clone(), &config.cycle_cron).await?;

    let state = Arc::new(api::AppState {
        store,
        scheduler: scheduler.clone(),
        transport,
        proxy_test: config.proxy_test.clone(),
    });

    let app = Router::new()
        .merge(SwaggerUi::new("/rank-tracker-swagger").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(api::health))
        .route("/cycle", post(api::trigger_cycle))
        .route("/jobs/:id/analytics", get(api::job_analytics))
        .route("/users/:id/usage", get(api::usage_stats))
        .route("/proxies/test", post(api::test_proxy))
        .with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("🛑 Shutdown signal received, finishing in-flight fetch...");
            }
            signal.cancel();
        })
        .await?;

    if let Err(e) = cron.shutdown().await {
        warn!("⚠️ Cron scheduler did not stop cleanly: {:?}", e);
    }
    scheduler.wait_idle().await;
    info!("👋 Rank tracker stopped");
    Ok(())
}
