use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::NotificationKind;

/// Fire-and-forget delivery of job outcomes. Implementations swallow and
/// log their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_scope: Uuid, kind: NotificationKind, payload: Value);
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_scope: Uuid, kind: NotificationKind, payload: Value) {
        info!(
            "📣 [Notify] {} for user {}: {}",
            kind.as_str(),
            user_scope,
            payload.get("jobName").and_then(|v| v.as_str()).unwrap_or("-")
        );
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, user_scope: Uuid, kind: NotificationKind, payload: Value) {
        let body = json!({
            "type": kind.as_str(),
            "userId": user_scope,
            "data": payload,
        });
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("📣 [Notify] {} delivered for user {}", kind.as_str(), user_scope);
            }
            Ok(resp) => error!("❌ [Notify] Webhook answered HTTP {} for {}", resp.status(), kind.as_str()),
            Err(e) => error!("❌ [Notify] Webhook delivery failed for {}: {}", kind.as_str(), e),
        }
    }
}
