use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::transport::{OutboundRequest, Transport, TransportError};

const PROXY_TEST_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

/// An upstream HTTP proxy configured by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProxyEndpoint {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub enabled: bool,
    /// Region codes (marketplaces) this proxy can exit from. Empty means any.
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub last_test_result: Option<ProxyTestResult>,
}

impl ProxyEndpoint {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// True when the most recent connectivity test failed. Untested
    /// endpoints are given the benefit of the doubt.
    pub fn is_failing(&self) -> bool {
        self.last_test_result.as_ref().map_or(false, |r| !r.success)
    }

    pub fn supports_region(&self, region: &str) -> bool {
        self.regions.is_empty() || self.regions.iter().any(|r| r.eq_ignore_ascii_case(region))
    }

    pub(crate) fn cache_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.id,
            self.url(),
            self.username.as_deref().unwrap_or_default()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ProxyTestResult {
    pub success: bool,
    pub message: String,
    pub latency_ms: Option<u64>,
    pub tested_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyTestConfig {
    pub url: String,
    pub timeout: Duration,
}

impl Default for ProxyTestConfig {
    fn default() -> Self {
        Self {
            url: "https://httpbin.org/ip".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Round-robin pool over enabled endpoints that did not fail their last
/// connectivity test. Clones share the cursor, so every executor handed a
/// clone keeps advancing the same rotation.
#[derive(Debug, Clone, Default)]
pub struct ProxyPool {
    endpoints: Arc<Vec<ProxyEndpoint>>,
    cursor: Arc<AtomicUsize>,
}

impl ProxyPool {
    pub fn new(endpoints: Vec<ProxyEndpoint>) -> Self {
        let (failing, usable): (Vec<_>, Vec<_>) = endpoints
            .into_iter()
            .filter(|p| p.enabled)
            .partition(ProxyEndpoint::is_failing);
        for p in &failing {
            let cause = p.last_test_result.as_ref().map(|r| r.message.as_str()).unwrap_or_default();
            warn!("⚠️ [ProxyPool] Leaving out proxy {}: last test failed ({})", p.id, cause);
        }
        Self {
            endpoints: Arc::new(usable),
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn next(&self) -> Option<ProxyEndpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(self.endpoints[idx].clone())
    }

    /// Narrow to endpoints exiting in `region`. Falls back to the whole pool
    /// when none of them do.
    pub fn for_region(&self, region: &str) -> ProxyPool {
        let matching: Vec<_> = self
            .endpoints
            .iter()
            .filter(|p| p.supports_region(region))
            .cloned()
            .collect();
        if matching.is_empty() {
            if !self.endpoints.is_empty() {
                warn!("⚠️ [ProxyPool] No proxy serves region {}, using all {} endpoints", region, self.len());
            }
            return self.clone();
        }
        if matching.len() == self.endpoints.len() {
            return self.clone();
        }
        ProxyPool::new(matching)
    }
}

/// Send one bounded request through `endpoint` to a known-good target.
/// Never errors: every failure, timeouts included, is reported in the result.
pub async fn test_endpoint(
    transport: &dyn Transport,
    endpoint: &ProxyEndpoint,
    config: &ProxyTestConfig,
) -> ProxyTestResult {
    let failure = |message: String| ProxyTestResult {
        success: false,
        message,
        latency_ms: None,
        tested_at: Utc::now(),
    };

    let url = match Url::parse(&config.url) {
        Ok(url) => url,
        Err(e) => return failure(format!("invalid test url: {}", e)),
    };
    let headers = [("User-Agent", PROXY_TEST_USER_AGENT.to_string())];

    let started = Instant::now();
    let result = transport
        .get(OutboundRequest {
            url: &url,
            headers: &headers,
            cookie: None,
            proxy: Some(endpoint),
            timeout: config.timeout,
        })
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    let outcome = match result {
        Ok(resp) if (200..300).contains(&resp.status) => ProxyTestResult {
            success: true,
            message: format!("Connection successful via {}", endpoint.id),
            latency_ms: Some(latency_ms),
            tested_at: Utc::now(),
        },
        Ok(resp) => failure(format!("HTTP {}", resp.status)),
        Err(TransportError::Timeout) => failure("timeout".to_string()),
        Err(e) => failure(format!("Connection failed: {}", e)),
    };

    info!(
        "🧪 [ProxyPool] Test {} -> success={} ({})",
        endpoint.id, outcome.success, outcome.message
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{proxy, ScriptedTransport};

    #[test]
    fn test_round_robin_skips_disabled() {
        let mut disabled = proxy("p2");
        disabled.enabled = false;
        let pool = ProxyPool::new(vec![proxy("p1"), disabled, proxy("p3")]);

        let ids: Vec<_> = (0..4).map(|_| pool.next().unwrap().id).collect();
        assert_eq!(ids, vec!["p1", "p3", "p1", "p3"]);
    }

    #[test]
    fn test_failed_last_test_excluded() {
        let tested = |id: &str, success: bool| ProxyEndpoint {
            last_test_result: Some(ProxyTestResult {
                success,
                message: if success { "ok".into() } else { "timeout".into() },
                latency_ms: None,
                tested_at: Utc::now(),
            }),
            ..proxy(id)
        };
        let pool = ProxyPool::new(vec![tested("dead", false), tested("alive", true), proxy("untested")]);

        assert_eq!(pool.len(), 2);
        let ids: Vec<_> = (0..4).map(|_| pool.next().unwrap().id).collect();
        assert_eq!(ids, vec!["alive", "untested", "alive", "untested"]);
        assert!(ProxyPool::new(vec![tested("dead", false)]).is_empty());
    }

    #[test]
    fn test_clones_share_cursor() {
        let pool = ProxyPool::new(vec![proxy("a"), proxy("b")]);
        let other = pool.clone();
        assert_eq!(pool.next().unwrap().id, "a");
        assert_eq!(other.next().unwrap().id, "b");
    }

    #[test]
    fn test_empty_pool_yields_none() {
        assert!(ProxyPool::empty().next().is_none());
        assert!(ProxyPool::new(vec![]).for_region("US").is_empty());
    }

    #[test]
    fn test_region_filter_with_fallback() {
        let mut us = proxy("us");
        us.regions = vec!["US".into()];
        let mut de = proxy("de");
        de.regions = vec!["DE".into(), "FR".into()];
        let pool = ProxyPool::new(vec![us, de]);

        let fr = pool.for_region("fr");
        assert_eq!(fr.len(), 1);
        assert_eq!(fr.next().unwrap().id, "de");

        assert_eq!(pool.for_region("JP").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_reports_timeout_as_failure() {
        let transport = ScriptedTransport::new(vec![Err(TransportError::Timeout)]);
        let result = test_endpoint(&transport, &proxy("slow"), &ProxyTestConfig::default()).await;

        assert!(!result.success);
        assert_eq!(result.message, "timeout");
        assert_eq!(transport.requests()[0].timeout, Duration::from_secs(10));
        assert_eq!(transport.requests()[0].proxy_id.as_deref(), Some("slow"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_success_and_http_failure() {
        let transport = ScriptedTransport::new(vec![
            Ok(ScriptedTransport::page(200, "{\"origin\":\"1.2.3.4\"}")),
            Ok(ScriptedTransport::page(407, "Proxy Authentication Required")),
        ]);
        let ok = test_endpoint(&transport, &proxy("p"), &ProxyTestConfig::default()).await;
        assert!(ok.success);
        assert!(ok.latency_ms.is_some());

        let denied = test_endpoint(&transport, &proxy("p"), &ProxyTestConfig::default()).await;
        assert!(!denied.success);
        assert_eq!(denied.message, "HTTP 407");
    }
}
