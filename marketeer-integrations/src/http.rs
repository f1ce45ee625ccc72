//! Shared outbound HTTP plumbing for platform adapters.
//!
//! One `RestClient` seam carries every adapter call: a 10 s per-call
//! timeout, automatic retry of 429/5xx responses with a per-category
//! backoff base, and per-platform token buckets fed from
//! `integrations.yaml`. Transport failures surface only after the retry
//! budget is spent; HTTP statuses are returned raw so callers can apply
//! verb-specific policy.

use crate::adapter::AdapterError;
use async_trait::async_trait;
use marketeer_core::config::PlatformBudget;
use marketeer_core::integration::PlatformCategory;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Per-call timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

/// One outbound request.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Platform tag for token-bucket accounting.
    pub platform: String,
    pub bearer: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RestRequest {
    pub fn new(method: HttpMethod, url: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            platform: platform.into(),
            bearer: None,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A raw response: status plus parsed JSON body (or `null`).
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    pub body: Value,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Pull a string field out of the response body.
    pub fn str_field(&self, pointer: &str) -> Option<String> {
        self.body
            .pointer(pointer)
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }
}

/// Map a non-success response to the adapter error policy: 401/403 are
/// auth-class, 429 is rate limiting, other 4xx/5xx are upstream failures.
pub fn ensure_success(response: RestResponse) -> Result<RestResponse, AdapterError> {
    match response.status {
        200..=299 => Ok(response),
        401 | 403 => Err(AdapterError::Auth {
            message: format!("status {}", response.status),
        }),
        429 => Err(AdapterError::RateLimited {
            message: "retry budget exhausted".into(),
        }),
        status => Err(AdapterError::Upstream {
            status,
            message: response
                .body
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        }),
    }
}

/// Trait seam for outbound HTTP; tests substitute scripted clients.
#[async_trait]
pub trait RestClient: Send + Sync {
    /// Execute a request for a platform in `category`, retrying 429/5xx.
    /// Returns the final response regardless of status; `Err` only for
    /// transport failures that survived the retry budget.
    async fn execute(
        &self,
        category: PlatformCategory,
        request: RestRequest,
    ) -> Result<RestResponse, AdapterError>;
}

/// Retry timing. The backoff base depends on the platform category.
#[derive(Debug, Clone, Copy)]
pub struct RetrySchedule {
    pub attempts: usize,
    pub cms_base: Duration,
    pub social_base: Duration,
    pub advertising_base: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            attempts: 3,
            cms_base: Duration::from_secs(30),
            social_base: Duration::from_secs(60),
            advertising_base: Duration::from_secs(120),
        }
    }
}

impl RetrySchedule {
    /// A schedule with no sleeping, for tests.
    pub fn immediate(attempts: usize) -> Self {
        Self {
            attempts,
            cms_base: Duration::ZERO,
            social_base: Duration::ZERO,
            advertising_base: Duration::ZERO,
        }
    }

    fn base_for(&self, category: PlatformCategory) -> Duration {
        match category {
            PlatformCategory::Cms => self.cms_base,
            PlatformCategory::Social => self.social_base,
            PlatformCategory::Advertising => self.advertising_base,
        }
    }

    /// Delay before retry `attempt` (0-based): base × (attempt + 1).
    pub fn delay(&self, category: PlatformCategory, attempt: usize) -> Duration {
        self.base_for(category).saturating_mul(attempt as u32 + 1)
    }
}

// ---------------------------------------------------------------------------
// Token buckets
// ---------------------------------------------------------------------------

/// Continuous-refill token bucket guarding one platform's request budget.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(requests_per_hour: u32) -> Self {
        let capacity = requests_per_hour.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 3600.0,
            last_refill: Instant::now(),
        }
    }

    fn try_acquire(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Real client over reqwest with retries and token buckets.
pub struct ReqwestRestClient {
    client: reqwest::Client,
    schedule: RetrySchedule,
    budgets: HashMap<String, PlatformBudget>,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl ReqwestRestClient {
    pub fn new(schedule: RetrySchedule, budgets: HashMap<String, PlatformBudget>) -> Self {
        Self {
            client: reqwest::Client::new(),
            schedule,
            budgets,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn acquire_budget(&self, platform: &str) -> bool {
        let budget = self
            .budgets
            .get(&platform.to_ascii_lowercase())
            .copied()
            .unwrap_or_default();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(platform.to_ascii_lowercase())
            .or_insert_with(|| TokenBucket::new(budget.requests_per_hour))
            .try_acquire()
    }

    async fn send_once(&self, request: &RestRequest) -> Result<RestResponse, String> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
        }
        .timeout(CALL_TIMEOUT);

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.json::<Value>().await.unwrap_or(Value::Null);
        Ok(RestResponse { status, body })
    }
}

#[async_trait]
impl RestClient for ReqwestRestClient {
    async fn execute(
        &self,
        category: PlatformCategory,
        request: RestRequest,
    ) -> Result<RestResponse, AdapterError> {
        if !self.acquire_budget(&request.platform) {
            return Err(AdapterError::RateLimited {
                message: format!("local budget exhausted for {}", request.platform),
            });
        }

        let mut last_transport = String::new();
        for attempt in 0..self.schedule.attempts {
            match self.send_once(&request).await {
                Ok(response) if response.status == 429 || response.status >= 500 => {
                    if attempt + 1 == self.schedule.attempts {
                        return Ok(response);
                    }
                    let delay = self.schedule.delay(category, attempt);
                    debug!(
                        platform = %request.platform,
                        status = response.status,
                        ?delay,
                        "retryable status, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => return Ok(response),
                Err(message) => {
                    last_transport = message;
                    if attempt + 1 < self.schedule.attempts {
                        tokio::time::sleep(self.schedule.delay(category, attempt)).await;
                    }
                }
            }
        }
        warn!(platform = %request.platform, error = %last_transport, "transport retries exhausted");
        Err(AdapterError::Transport {
            message: last_transport,
        })
    }
}
