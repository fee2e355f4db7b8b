use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use reqwest::{Client, Url};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::proxy::ProxyEndpoint;

/// A single outbound GET, fully described.
#[derive(Debug, Clone)]
pub struct OutboundRequest<'a> {
    pub url: &'a Url,
    pub headers: &'a [(&'static str, String)],
    pub cookie: Option<&'a str>,
    pub proxy: Option<&'a ProxyEndpoint>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub set_cookies: Vec<String>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("timeout")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid proxy '{proxy}': {reason}")]
    InvalidProxy { proxy: String, reason: String },
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, request: OutboundRequest<'_>) -> Result<RawResponse, TransportError>;
}

/// reqwest-backed transport. reqwest binds proxies at client level, so one
/// client is kept per proxy endpoint.
pub struct ReqwestTransport {
    direct: Client,
    proxied: Mutex<HashMap<String, Client>>,
}

impl ReqwestTransport {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            direct: base_builder().no_proxy().build()?,
            proxied: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, proxy: Option<&ProxyEndpoint>) -> Result<Client, TransportError> {
        let Some(proxy) = proxy else {
            return Ok(self.direct.clone());
        };

        let key = proxy.cache_key();
        let mut cache = self.proxied.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = cache.get(&key) {
            return Ok(client.clone());
        }

        let invalid = |reason: String| TransportError::InvalidProxy {
            proxy: proxy.id.clone(),
            reason,
        };
        let mut upstream = reqwest::Proxy::all(proxy.url()).map_err(|e| invalid(e.to_string()))?;
        if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
            upstream = upstream.basic_auth(user, pass);
        }
        let client = base_builder()
            .proxy(upstream)
            .build()
            .map_err(|e| invalid(e.to_string()))?;
        cache.insert(key, client.clone());
        Ok(client)
    }
}

fn base_builder() -> reqwest::ClientBuilder {
    Client::builder()
        .redirect(reqwest::redirect::Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .deflate(true)
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, request: OutboundRequest<'_>) -> Result<RawResponse, TransportError> {
        let client = self.client_for(request.proxy)?;

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers {
            if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
                headers.insert(name, value);
            }
        }
        if let Some(cookie) = request.cookie {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }

        let resp = client
            .get(request.url.clone())
            .headers(headers)
            .timeout(request.timeout)
            .send()
            .await
            .map_err(classify_error)?;

        let status = resp.status().as_u16();
        let set_cookies = resp
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok().map(|s| s.to_string()))
            .collect();
        let body = resp.text().await.map_err(classify_error)?;

        Ok(RawResponse {
            status,
            body,
            set_cookies,
        })
    }
}

fn classify_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}
