//! HTTP transport seam
//!
//! The remote client only ever sees [`ApiRequest`] / [`ApiResponse`], so the
//! network can be swapped for a scripted transport in tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;

use crate::error::{SyncError, SyncResult};

#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the API base, e.g. `/api/v2/requisitions/`.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    pub bearer: Option<String>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            bearer: None,
        }
    }

    pub fn query(mut self, key: &str, value: &str) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn bearer(mut self, token: &str) -> Self {
        self.bearer = Some(token.to_string());
        self
    }
}

#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    /// Lower-cased header names.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON. An empty body is `null`.
    pub fn json(&self) -> SyncResult<serde_json::Value> {
        if self.body.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn rate_limits(&self) -> RateLimitHeaders {
        RateLimitHeaders::from_headers(&self.headers)
    }
}

/// Rate-limit headers, all optional.
///
/// The API has been seen sending both `X-RateLimit-Account-Success-Limit`
/// and the CGI-style `HTTP_X_RATELIMIT_ACCOUNT_SUCCESS_LIMIT`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    pub general_limit: Option<u32>,
    pub general_remaining: Option<u32>,
    pub account_limit: Option<u32>,
    pub account_remaining: Option<u32>,
    pub account_reset_secs: Option<u64>,
}

impl RateLimitHeaders {
    pub fn from_headers(headers: &HashMap<String, String>) -> Self {
        let mut parsed = Self::default();
        for (name, value) in headers {
            let normalized = name.to_ascii_lowercase().replace('-', "_");
            let normalized = normalized.strip_prefix("http_").unwrap_or(&normalized);
            let value = value.trim();
            match normalized {
                "x_ratelimit_limit" => parsed.general_limit = value.parse().ok(),
                "x_ratelimit_remaining" => parsed.general_remaining = value.parse().ok(),
                "x_ratelimit_account_success_limit" => parsed.account_limit = value.parse().ok(),
                "x_ratelimit_account_success_remaining" => {
                    parsed.account_remaining = value.parse().ok()
                }
                "x_ratelimit_account_success_reset" => {
                    parsed.account_reset_secs = value.parse().ok()
                }
                _ => {}
            }
        }
        parsed
    }

    /// `(limit, remaining)` for the account-scoped daily quota, when both were sent.
    pub fn account(&self) -> Option<(u32, u32)> {
        Some((self.account_limit?, self.account_remaining?))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse>;
}

/// reqwest-backed transport with a per-request timeout.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> SyncResult<ApiResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        tracing::debug!("{} {}", request.method, url);

        let mut builder = self
            .http
            .request(request.method.clone(), &url)
            .header("Accept", "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(ref token) = request.bearer {
            builder = builder.bearer_auth(token);
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Transport(format!("{} {} timed out", request.method, url))
            } else {
                SyncError::Transport(format!("{} {} failed: {}", request.method, url, e))
            }
        })?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = resp.text().await.map_err(|e| {
            SyncError::Transport(format!(
                "{} {} body read failed: {}",
                request.method, url, e
            ))
        })?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
