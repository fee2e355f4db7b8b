//! One logical "fetch a page": identity, session and proxy selection, block
//! detection, and the bounded retry loop with exponential backoff.

use rand::rngs::StdRng;
use rand::Rng;
use reqwest::Url;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::identity::IdentityRotator;
use crate::proxy::{ProxyEndpoint, ProxyPool};
use crate::session::SessionState;
use crate::transport::{OutboundRequest, RawResponse, Transport, TransportError};

pub const DEFAULT_BLOCK_SIGNATURES: &[&str] = &[
    "captcha",
    "verify you are human",
    "unusual traffic",
    "suspicious activity",
    "security check",
    "prove you're not a robot",
    "robot check",
    "automated access",
];

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_attempts: u32,
    pub fetch_timeout: Duration,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub backoff_jitter_ms: u64,
    /// Lower-case phrases; any one found in a body means we were challenged.
    pub block_signatures: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            fetch_timeout: Duration::from_secs(30),
            backoff_base_ms: 1_000,
            backoff_cap_ms: 10_000,
            backoff_jitter_ms: 1_000,
            block_signatures: DEFAULT_BLOCK_SIGNATURES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    Status(u16),
    Challenge(String),
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::Status(code) => write!(f, "HTTP {}", code),
            BlockReason::Challenge(phrase) => write!(f, "challenge page ('{}')", phrase),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success(String),
    Blocked(BlockReason),
    TransientError(String),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success(_))
    }

    fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::Blocked(_) => "blocked",
            FetchOutcome::TransientError(_) => "transient",
        }
    }
}

/// Raised only for problems retrying cannot fix.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("malformed url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// What the loop does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Return,
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct ExecutorStats {
    pub attempts: u32,
    pub successes: u32,
    pub blocked: u32,
    pub transient: u32,
    pub rotations: u32,
}

impl ExecutorStats {
    pub fn merge(&mut self, other: &ExecutorStats) {
        self.attempts += other.attempts;
        self.successes += other.successes;
        self.blocked += other.blocked;
        self.transient += other.transient;
        self.rotations += other.rotations;
    }
}

/// Per-job fetch context. Owns its session so nothing leaks between jobs.
pub struct RequestExecutor {
    transport: Arc<dyn Transport>,
    identities: IdentityRotator,
    proxies: ProxyPool,
    session: SessionState,
    config: ExecutorConfig,
    rng: StdRng,
    stats: ExecutorStats,
    /// Endpoints the transport refused to build a client for.
    unusable_proxies: HashSet<String>,
    last_user_agent: Option<&'static str>,
}

impl RequestExecutor {
    pub fn new(
        transport: Arc<dyn Transport>,
        identities: IdentityRotator,
        proxies: ProxyPool,
        session: SessionState,
        config: ExecutorConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            transport,
            identities,
            proxies,
            session,
            config,
            rng,
            stats: ExecutorStats::default(),
            unusable_proxies: HashSet::new(),
            last_user_agent: None,
        }
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            rotations: self.session.rotation_count(),
            ..self.stats
        }
    }

    /// Agent presented on the most recent attempt.
    pub fn last_user_agent(&self) -> Option<&'static str> {
        self.last_user_agent
    }

    #[cfg(test)]
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub async fn fetch(&mut self, url: &str) -> Result<FetchOutcome, ExecutorError> {
        let parsed = Url::parse(url).map_err(|e| ExecutorError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                sleep(self.identities.minimum_interval(&mut self.rng)).await;
            }
            if self.session.is_stale() {
                debug!("⏳ [Executor] Session older than timeout, rotating");
                self.session.rotate();
            }

            let outcome = self.attempt(&parsed, attempt + 1).await?;
            match self.decide(attempt, &outcome) {
                RetryDecision::Return => return Ok(outcome),
                RetryDecision::GiveUp => {
                    warn!(
                        "❌ [Executor] Giving up on {} after {} attempts ({})",
                        url,
                        max_attempts,
                        outcome.label()
                    );
                    return Ok(outcome);
                }
                RetryDecision::RetryAfter(delay) => {
                    debug!("⏳ [Executor] Backing off {:?} before retry", delay);
                    sleep(delay).await;
                }
            }
            attempt += 1;
        }
    }

    async fn attempt(&mut self, url: &Url, number: u32) -> Result<FetchOutcome, ExecutorError> {
        let identity = self.identities.next_identity(&mut self.rng);
        let cookie = self.session.current();
        let proxy = self.next_proxy();
        self.last_user_agent = Some(identity.user_agent);

        match &proxy {
            Some(p) => info!("🔄 [Executor] Attempt {}/{} via proxy {}: {}", number, self.config.max_attempts, p.id, url),
            None => info!("🌐 [Executor] Attempt {}/{} direct: {}", number, self.config.max_attempts, url),
        }
        debug!("Using User-Agent ({:?}): {}", identity.family, identity.user_agent);

        self.stats.attempts += 1;
        let result = self
            .transport
            .get(OutboundRequest {
                url,
                headers: &identity.headers,
                cookie: cookie.as_deref(),
                proxy: proxy.as_ref(),
                timeout: self.config.fetch_timeout,
            })
            .await;

        let outcome = match result {
            Ok(resp) => {
                let outcome = classify_response(&resp, &self.config.block_signatures);
                if outcome.is_success() {
                    self.session.absorb_set_cookies(&resp.set_cookies);
                    info!("✅ [Executor] Fetched {} bytes", resp.body.len());
                }
                outcome
            }
            Err(TransportError::InvalidProxy { proxy, reason }) => {
                error!("❌ [Executor] Proxy {} is misconfigured ({}), not using it again for this job", proxy, reason);
                let cause = format!("invalid proxy '{}': {}", proxy, reason);
                self.unusable_proxies.insert(proxy);
                FetchOutcome::TransientError(cause)
            }
            Err(err) => FetchOutcome::TransientError(err.to_string()),
        };

        match &outcome {
            FetchOutcome::Success(_) => self.stats.successes += 1,
            FetchOutcome::Blocked(reason) => {
                self.stats.blocked += 1;
                warn!("🚫 [Executor] Attempt {} blocked: {}, rotating session", number, reason);
                self.session.rotate();
            }
            FetchOutcome::TransientError(cause) => {
                self.stats.transient += 1;
                warn!("⚠️ [Executor] Attempt {} failed: {}", number, cause);
            }
        }
        Ok(outcome)
    }

    /// Next endpoint in rotation that the transport has not rejected. `None`
    /// means direct.
    fn next_proxy(&self) -> Option<ProxyEndpoint> {
        for _ in 0..self.proxies.len() {
            let candidate = self.proxies.next()?;
            if !self.unusable_proxies.contains(&candidate.id) {
                return Some(candidate);
            }
        }
        None
    }

    fn decide(&mut self, attempt: u32, outcome: &FetchOutcome) -> RetryDecision {
        if outcome.is_success() {
            return RetryDecision::Return;
        }
        if attempt + 1 >= self.config.max_attempts.max(1) {
            return RetryDecision::GiveUp;
        }
        let jitter = if self.config.backoff_jitter_ms > 0 {
            self.rng.gen_range(0..self.config.backoff_jitter_ms)
        } else {
            0
        };
        RetryDecision::RetryAfter(
            backoff_delay(attempt, self.config.backoff_base_ms, self.config.backoff_cap_ms)
                + Duration::from_millis(jitter),
        )
    }
}

/// `min(base * 2^attempt, cap)`, attempt counted from zero.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

/// Block codes win over everything, then challenge phrases (whatever the
/// status), then plain success or failure by status class.
pub fn classify_response(resp: &RawResponse, signatures: &[String]) -> FetchOutcome {
    if resp.status == 403 || resp.status == 503 {
        return FetchOutcome::Blocked(BlockReason::Status(resp.status));
    }
    if let Some(phrase) = find_block_signature(&resp.body, signatures) {
        return FetchOutcome::Blocked(BlockReason::Challenge(phrase.to_string()));
    }
    if (200..300).contains(&resp.status) {
        FetchOutcome::Success(resp.body.clone())
    } else {
        FetchOutcome::TransientError(format!("HTTP {}", resp.status))
    }
}

pub fn find_block_signature<'a>(body: &str, signatures: &'a [String]) -> Option<&'a str> {
    let lower = body.to_lowercase();
    signatures
        .iter()
        .map(|s| s.as_str())
        .find(|s| !s.is_empty() && lower.contains(&s.to_lowercase()))
}
