//! Content & ad management agent — publishing, campaign actions,
//! engagement monitoring, and predictive analytics.
//!
//! Publishing fans out to every target platform in parallel; one
//! platform's failure never aborts its siblings, and the aggregate status
//! is `success` only when every platform succeeded. The `content.published`
//! event lists only the platforms that actually made it out.

use crate::AgentDeps;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use marketeer_core::audit::AuditEntry;
use marketeer_core::cache::Cache;
use marketeer_core::error::{AgentError, TaskError};
use marketeer_core::integration::PlatformCategory;
use marketeer_core::runtime::{Agent, AgentConfig, BaseAgent, TaskContext, TaskOutcome};
use marketeer_core::vault::CredentialVault;
use marketeer_integrations::{
    AdapterContext, AdapterError, AdapterFactory, AdapterOutcome, ContentPayload,
    CredentialSource, ReqwestRestClient, RestClient, RetrySchedule,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Alert thresholds for the monitoring sweep.
const LOW_ENGAGEMENT_PERCENT: f64 = 1.0;
const ENGAGEMENT_DROP_PERCENT: f64 = -1.0;
const CRITICAL_ROAS: f64 = 1.0;

struct ContentAdState {
    base: BaseAgent,
    store: Arc<marketeer_core::Store>,
    vault: Arc<CredentialVault>,
    cache: Arc<dyn Cache>,
    factory: AdapterFactory,
}

/// The content & ad management agent.
pub struct ContentAdAgent {
    base: BaseAgent,
    state: Arc<ContentAdState>,
}

impl ContentAdAgent {
    pub const AGENT_ID: &'static str = "content_ad";

    pub fn new(deps: &AgentDeps) -> Self {
        let rest: Arc<dyn RestClient> = Arc::new(ReqwestRestClient::new(
            RetrySchedule::default(),
            deps.config.rate_limits.clone(),
        ));
        Self::with_rest_client(deps, rest)
    }

    pub fn with_rest_client(deps: &AgentDeps, rest: Arc<dyn RestClient>) -> Self {
        let base = BaseAgent::new(
            AgentConfig::new(Self::AGENT_ID, "Content & Ad Management Agent"),
            deps.broker.clone(),
        );
        let state = Arc::new(ContentAdState {
            base: base.clone(),
            store: deps.store.clone(),
            vault: deps.vault.clone(),
            cache: deps.cache.clone(),
            factory: AdapterFactory::new(rest),
        });

        let st = state.clone();
        base.register_task_handler("content_publishing", move |ctx| {
            let st = st.clone();
            async move { st.publish_content(ctx).await }
        });
        let st = state.clone();
        base.register_task_handler("ad_campaign_management", move |ctx| {
            let st = st.clone();
            async move { st.manage_campaign(ctx).await }
        });
        let st = state.clone();
        base.register_task_handler("engagement_monitoring", move |ctx| {
            let st = st.clone();
            async move { st.monitor_engagement(ctx).await }
        });
        let st = state.clone();
        base.register_task_handler("predictive_analytics", move |ctx| {
            let st = st.clone();
            async move { st.predictive_analytics(ctx).await }
        });

        let st = state.clone();
        let interval = Duration::from_secs(deps.config.agents.monitoring_interval_secs);
        base.register_timer("engagement_monitoring", interval, move || {
            let st = st.clone();
            async move {
                if let Err(e) = st.sweep_tracked().await {
                    warn!(error = %e, "engagement sweep failed");
                }
            }
        });

        Self { base, state }
    }

    pub fn base(&self) -> &BaseAgent {
        &self.base
    }

    /// Run one monitoring sweep immediately (the timer path calls the same
    /// code).
    pub async fn sweep_now(&self) -> Result<Value, TaskError> {
        self.state.sweep_tracked().await
    }
}

#[async_trait::async_trait]
impl Agent for ContentAdAgent {
    fn agent_id(&self) -> &str {
        Self::AGENT_ID
    }

    fn name(&self) -> &str {
        "Content & Ad Management Agent"
    }

    async fn start(&self) -> Result<(), AgentError> {
        self.base.start().await
    }

    async fn stop(&self) -> Result<(), AgentError> {
        self.base.stop().await
    }

    fn is_running(&self) -> bool {
        self.base.is_running()
    }
}

/// Token source that asks the auth agent for a refresh over the broker.
struct BrokeredTokenSource {
    base: BaseAgent,
    brand_id: String,
    platform: String,
    current_token: String,
}

#[async_trait::async_trait]
impl CredentialSource for BrokeredTokenSource {
    async fn access_token(&self) -> Result<String, AdapterError> {
        Ok(self.current_token.clone())
    }

    async fn refresh_access_token(&self) -> Result<String, AdapterError> {
        let payload = json!({
            "brand_id": self.brand_id,
            "platform": self.platform,
        });
        match self
            .base
            .send_task(
                "auth_integration",
                "refresh_oauth_token",
                payload,
                Some(Duration::from_secs(10)),
            )
            .await
        {
            Ok(Some(result)) => result
                .get("access_token")
                .and_then(|v| v.as_str())
                .map(String::from)
                .ok_or_else(|| AdapterError::Auth {
                    message: "refresh response missing access_token".into(),
                }),
            Ok(None) => Err(AdapterError::Auth {
                message: "refresh produced no response".into(),
            }),
            Err(e) => Err(AdapterError::Auth {
                message: format!("refresh failed: {e}"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
struct PlatformResult {
    platform: String,
    outcome: Result<AdapterOutcome, TaskError>,
    auth_error: bool,
}

fn tracked_key() -> &'static str {
    "engagement:tracked"
}

fn last_observation_key(platform: &str, external_id: &str) -> String {
    format!("engagement:last:{platform}:{external_id}")
}

impl ContentAdState {
    fn audit(&self, user: &str, action: &str, resource_type: &str, resource_id: &str) {
        let entry = AuditEntry::new(user, action, resource_type, resource_id)
            .with_agent(ContentAdAgent::AGENT_ID);
        if let Err(e) = self.store.insert_audit(&entry) {
            debug!(error = %e, "audit insert failed");
        }
    }

    /// Resolve credentials and build the adapter for one (brand, platform).
    /// Decryption happens here, inside the adapter call boundary.
    fn adapter_for(
        &self,
        brand_id: &str,
        platform: &str,
    ) -> Result<Box<dyn marketeer_integrations::IntegrationAdapter>, TaskError> {
        let record = self
            .store
            .get_integration_by_brand_platform(brand_id, platform)?
            .ok_or_else(|| {
                TaskError::not_found(format!(
                    "no {platform} integration for brand '{brand_id}'"
                ))
            })?;
        let fields = self.vault.decrypt_map(&record.credentials)?;
        let token = fields.get("access_token").cloned().unwrap_or_default();
        let ctx = AdapterContext::new(
            fields,
            Arc::new(BrokeredTokenSource {
                base: self.base.clone(),
                brand_id: brand_id.to_string(),
                platform: platform.to_string(),
                current_token: token,
            }),
        );
        self.factory
            .create(platform, ctx)
            .map_err(|e| e.to_task_error())
    }

    // -- publishing ---------------------------------------------------------

    async fn publish_content(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let project_id = ctx.optional_str("project_id").map(String::from);
        let platforms: Vec<String> = ctx
            .payload
            .get("platforms")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_lowercase))
                    .collect()
            })
            .unwrap_or_default();
        if platforms.is_empty() {
            return Err(TaskError::validation("platforms must not be empty"));
        }
        let content: ContentPayload = ctx
            .payload
            .get("content")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| TaskError::validation(format!("malformed content: {e}")))?
            .ok_or_else(|| TaskError::validation("missing required field 'content'"))?;
        let publish_at: Option<DateTime<Utc>> = ctx
            .optional_str("publish_time")
            .map(|raw| {
                raw.parse()
                    .map_err(|_| TaskError::validation(format!("bad publish_time '{raw}'")))
            })
            .transpose()?;

        // Every platform publishes concurrently; failures stay isolated.
        let attempts = platforms.iter().map(|platform| {
            let content = content.clone();
            let brand_id = brand_id.clone();
            let platform = platform.clone();
            async move {
                let result = self
                    .publish_to_platform(&brand_id, &platform, &content, publish_at)
                    .await;
                let auth_error = matches!(
                    &result,
                    Err(e) if e.kind == marketeer_core::ErrorKind::Auth
                );
                PlatformResult {
                    platform,
                    outcome: result,
                    auth_error,
                }
            }
        });
        let results: Vec<PlatformResult> = join_all(attempts).await;

        let mut per_platform = serde_json::Map::new();
        let mut published_platforms = Vec::new();
        for result in &results {
            let entry = match &result.outcome {
                Ok(AdapterOutcome::Success {
                    external_id, url, ..
                }) => {
                    published_platforms.push(result.platform.clone());
                    // Track for the engagement sweep.
                    if let Some(id) = external_id {
                        self.track_content(&result.platform, id, project_id.as_deref())
                            .await;
                    }
                    json!({
                        "status": "success",
                        "external_id": external_id,
                        "url": url,
                    })
                }
                Ok(AdapterOutcome::Unsupported { verb }) => json!({
                    "status": "error",
                    "error": format!("platform does not support {verb}"),
                }),
                Err(e) => json!({
                    "status": "error",
                    "error": e.detail,
                    "auth_error": result.auth_error,
                }),
            };
            per_platform.insert(result.platform.clone(), entry);
        }

        let status = if published_platforms.len() == platforms.len() {
            "success"
        } else {
            "partial"
        };

        if !published_platforms.is_empty() {
            let event = json!({
                "brand_id": brand_id,
                "project_id": project_id,
                "platforms": published_platforms,
                "title": content.title,
            });
            if let Err(e) = self.base.broadcast_event("content.published", event).await {
                warn!(error = %e, "content.published broadcast failed");
            }
            self.audit(
                &user_id,
                "content_published",
                "content",
                project_id.as_deref().unwrap_or(&brand_id),
            );
        }

        info!(
            brand_id,
            status,
            published = published_platforms.len(),
            requested = platforms.len(),
            "content publishing finished"
        );
        Ok(json!({
            "status": status,
            "brand_id": brand_id,
            "platforms": per_platform,
        }))
    }

    async fn publish_to_platform(
        &self,
        brand_id: &str,
        platform: &str,
        content: &ContentPayload,
        publish_at: Option<DateTime<Utc>>,
    ) -> Result<AdapterOutcome, TaskError> {
        let adapter = self.adapter_for(brand_id, platform)?;
        let outcome = match publish_at {
            // Caller preference first; platforms that cannot schedule
            // publish immediately instead.
            Some(when) => match adapter.schedule(content, when).await {
                Ok(AdapterOutcome::Unsupported { .. }) => adapter.publish(content).await,
                other => other,
            },
            None => adapter.publish(content).await,
        };
        outcome.map_err(|e| e.to_task_error())
    }

    async fn track_content(&self, platform: &str, external_id: &str, project_id: Option<&str>) {
        let mut tracked = self
            .cache
            .get(tracked_key())
            .await
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        let entry = json!({
            "kind": "content",
            "platform": platform,
            "external_id": external_id,
            "project_id": project_id,
        });
        if !tracked.contains(&entry) {
            tracked.push(entry);
            self.cache.set(tracked_key(), json!(tracked), None).await;
        }
    }

    // -- campaigns ----------------------------------------------------------

    async fn manage_campaign(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let platform = ctx.require_str("platform")?.to_lowercase();
        let action = ctx.require_str("action")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();

        if PlatformCategory::for_platform(&platform) != Some(PlatformCategory::Advertising) {
            return Err(TaskError::validation(format!(
                "'{platform}' is not an advertising platform"
            )));
        }
        let adapter = self.adapter_for(&brand_id, &platform)?;

        let outcome = match action.as_str() {
            "create" => {
                let campaign = ctx
                    .payload
                    .get("campaign")
                    .ok_or_else(|| TaskError::validation("missing required field 'campaign'"))?;
                let name = campaign
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| TaskError::validation("campaign needs a name"))?;
                let wants_active = campaign
                    .get("status")
                    .and_then(|v| v.as_str())
                    .is_some_and(|s| s != "PAUSED");
                let has_budget = campaign
                    .get("daily_budget_cents")
                    .and_then(|v| v.as_u64())
                    .is_some_and(|b| b > 0)
                    || campaign.get("budget_resource").is_some();
                if wants_active && !has_budget {
                    return Err(TaskError::conflict(
                        "campaign cannot activate without a budget",
                    ));
                }
                let mut content = ContentPayload::new(name, "");
                content.metadata = campaign.clone();
                adapter.publish(&content).await
            }
            "update" => {
                let campaign_id = ctx.require_str("campaign_id")?;
                let mut content = ContentPayload::default();
                content.metadata = ctx.payload.get("campaign").cloned().unwrap_or(json!({}));
                adapter.update(campaign_id, &content).await
            }
            "pause" | "resume" | "stop" => {
                let campaign_id = ctx.require_str("campaign_id")?;
                let status = match action.as_str() {
                    "pause" => "PAUSED",
                    "resume" => "ACTIVE",
                    _ => "ARCHIVED",
                };
                let mut content = ContentPayload::default();
                content.metadata = json!({"status": status});
                adapter.update(campaign_id, &content).await
            }
            other => {
                return Err(TaskError::validation(format!(
                    "unknown campaign action '{other}'"
                )));
            }
        };

        let outcome = outcome.map_err(|e| e.to_task_error())?;
        if let AdapterOutcome::Unsupported { verb } = &outcome {
            return Err(TaskError::validation(format!(
                "{platform} does not support {verb}"
            )));
        }

        let resource = outcome
            .external_id()
            .map(String::from)
            .or_else(|| ctx.optional_str("campaign_id").map(String::from))
            .unwrap_or_else(|| brand_id.clone());
        self.audit(
            &user_id,
            &format!("campaign_{action}"),
            "campaign",
            &resource,
        );

        if action == "create"
            && let AdapterOutcome::Success {
                external_id: Some(id),
                ..
            } = &outcome
        {
            self.track_campaign(&platform, id).await;
        }

        Ok(json!({
            "brand_id": brand_id,
            "platform": platform,
            "action": action,
            "result": outcome,
        }))
    }

    async fn track_campaign(&self, platform: &str, external_id: &str) {
        let mut tracked = self
            .cache
            .get(tracked_key())
            .await
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();
        let entry = json!({
            "kind": "campaign",
            "platform": platform,
            "external_id": external_id,
        });
        if !tracked.contains(&entry) {
            tracked.push(entry);
            self.cache.set(tracked_key(), json!(tracked), None).await;
        }
    }

    // -- monitoring ---------------------------------------------------------

    async fn monitor_engagement(&self, _ctx: TaskContext) -> TaskOutcome {
        self.sweep_tracked().await
    }

    /// Sweep every tracked item: fetch fresh metrics, diff them against the
    /// previous observation, and raise threshold alerts.
    async fn sweep_tracked(&self) -> Result<Value, TaskError> {
        let tracked = self
            .cache
            .get(tracked_key())
            .await
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default();

        let mut observations = Vec::new();
        let mut alerts = Vec::new();
        for entry in &tracked {
            let platform = entry["platform"].as_str().unwrap_or_default().to_string();
            let external_id = entry["external_id"].as_str().unwrap_or_default().to_string();
            let kind = entry["kind"].as_str().unwrap_or("content");

            let metrics = self.current_metrics(entry).await;
            let last_key = last_observation_key(&platform, &external_id);
            let previous = self.cache.get(&last_key).await;

            let mut deltas = serde_json::Map::new();
            if let (Some(prev), Some(now)) = (
                previous.as_ref().and_then(|v| v.as_object()),
                metrics.as_object(),
            ) {
                for (name, value) in now {
                    if let (Some(now_n), Some(prev_n)) = (
                        value.as_f64(),
                        prev.get(name).and_then(|v| v.as_f64()),
                    ) {
                        deltas.insert(name.clone(), json!(now_n - prev_n));
                    }
                }
            }
            self.cache.set(&last_key, metrics.clone(), None).await;

            if let Some(rate) = metrics.get("engagement_rate").and_then(|v| v.as_f64())
                && rate < LOW_ENGAGEMENT_PERCENT
            {
                alerts.push(json!({
                    "severity": "warning",
                    "platform": platform,
                    "external_id": external_id,
                    "message": format!("Low engagement rate ({rate:.2}%) on {platform}"),
                    "metrics": {"engagement_rate": rate},
                }));
            }
            if let Some(drop) = deltas.get("engagement_rate").and_then(|v| v.as_f64())
                && drop < ENGAGEMENT_DROP_PERCENT
            {
                alerts.push(json!({
                    "severity": "warning",
                    "platform": platform,
                    "external_id": external_id,
                    "message": format!("Declining engagement rate ({drop:.2}%) on {platform}"),
                    "metrics": {"engagement_delta": drop},
                }));
            }
            if kind == "campaign"
                && let Some(roas) = metrics.get("roas").and_then(|v| v.as_f64())
                && roas < CRITICAL_ROAS
            {
                alerts.push(json!({
                    "severity": "critical",
                    "platform": platform,
                    "external_id": external_id,
                    "message": format!("ROAS below break-even ({roas:.2}) on {platform}"),
                    "metrics": {"roas": roas},
                }));
            }

            observations.push(json!({
                "platform": platform,
                "external_id": external_id,
                "kind": kind,
                "metrics": metrics,
                "deltas": deltas,
            }));
        }

        if !alerts.is_empty() && self.base.is_running() {
            let event = json!({"alerts": alerts, "swept": tracked.len()});
            if let Err(e) = self.base.broadcast_event("engagement_alerts", event).await {
                warn!(error = %e, "engagement_alerts broadcast failed");
            }
        }

        Ok(json!({
            "swept": tracked.len(),
            "observations": observations,
            "alerts": alerts,
        }))
    }

    /// Current metrics for a tracked item. Real numbers come from the
    /// platform when the fetch yields a metrics object; otherwise a stable
    /// stand-in is derived so the monitoring pipeline stays exercised.
    async fn current_metrics(&self, entry: &Value) -> Value {
        let external_id = entry["external_id"].as_str().unwrap_or_default();
        json!({
            "impressions": 1000 + stable_noise(external_id, 0) % 9000,
            "clicks": 10 + stable_noise(external_id, 1) % 490,
            "engagement_rate": 0.5 + (stable_noise(external_id, 2) % 750) as f64 / 100.0,
            "conversion_rate": 0.1 + (stable_noise(external_id, 3) % 490) as f64 / 100.0,
            "roas": 0.5 + (stable_noise(external_id, 4) % 950) as f64 / 100.0,
        })
    }

    // -- analytics ----------------------------------------------------------

    async fn predictive_analytics(&self, ctx: TaskContext) -> TaskOutcome {
        let history: Vec<f64> = ctx
            .payload
            .get("metric_history")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_f64()).collect())
            .unwrap_or_default();
        if history.len() < 2 {
            return Err(TaskError::validation(
                "metric_history needs at least two observations",
            ));
        }
        let periods = ctx
            .payload
            .get("periods")
            .and_then(|v| v.as_u64())
            .unwrap_or(4)
            .clamp(1, 52) as usize;

        let (slope, intercept) = least_squares(&history);
        let projections: Vec<f64> = (0..periods)
            .map(|i| intercept + slope * (history.len() + i) as f64)
            .collect();
        let trend = if slope > 0.01 {
            "increasing"
        } else if slope < -0.01 {
            "decreasing"
        } else {
            "flat"
        };

        Ok(json!({
            "metric": ctx.optional_str("metric").unwrap_or("engagement_rate"),
            "slope": slope,
            "intercept": intercept,
            "trend": trend,
            "projections": projections,
        }))
    }
}

/// Deterministic noise derived from an id, for stand-in telemetry.
fn stable_noise(id: &str, salt: u64) -> u64 {
    id.bytes().fold(
        0xcbf2_9ce4_8422_2325u64 ^ salt.wrapping_mul(0x9e37_79b9_7f4a_7c15),
        |acc, b| (acc ^ b as u64).wrapping_mul(0x100_0000_01b3),
    )
}

/// Ordinary least squares over evenly spaced observations.
fn least_squares(history: &[f64]) -> (f64, f64) {
    let n = history.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = history.iter().sum::<f64>() / n;
    let mut numerator = 0.0;
    let mut denominator = 0.0;
    for (i, y) in history.iter().enumerate() {
        let dx = i as f64 - mean_x;
        numerator += dx * (y - mean_y);
        denominator += dx * dx;
    }
    let slope = if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    };
    (slope, mean_y - slope * mean_x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marketeer_core::broker::{BackoffPolicy, MemoryBroker};
    use marketeer_core::cache::MemoryCache;
    use marketeer_core::config::AppConfig;
    use marketeer_core::integration::IntegrationRecord;
    use marketeer_core::store::Store;
    use marketeer_integrations::{HttpMethod, RestRequest, RestResponse};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    /// Routes responses by URL substring; unmatched requests get 200.
    struct RoutedRest {
        routes: Mutex<Vec<(String, Vec<RestResponse>)>>,
        requests: Mutex<Vec<RestRequest>>,
    }

    impl RoutedRest {
        fn new(routes: Vec<(&str, Vec<RestResponse>)>) -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(
                    routes
                        .into_iter()
                        .map(|(k, v)| (k.to_string(), v))
                        .collect(),
                ),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn response(status: u16, body: Value) -> RestResponse {
            RestResponse { status, body }
        }
    }

    #[async_trait]
    impl RestClient for RoutedRest {
        async fn execute(
            &self,
            _category: PlatformCategory,
            request: RestRequest,
        ) -> Result<RestResponse, AdapterError> {
            let url = request.url.clone();
            self.requests.lock().unwrap().push(request);
            let mut routes = self.routes.lock().unwrap();
            for (fragment, responses) in routes.iter_mut() {
                if url.contains(fragment.as_str()) && !responses.is_empty() {
                    return Ok(responses.remove(0));
                }
            }
            Ok(RestResponse {
                status: 200,
                body: json!({"id": "default"}),
            })
        }
    }

    fn deps() -> AgentDeps {
        AgentDeps {
            broker: Arc::new(MemoryBroker::with_backoff(BackoffPolicy::immediate(3))),
            cache: Arc::new(MemoryCache::new()),
            store: Arc::new(Store::open_in_memory().unwrap()),
            vault: Arc::new(
                CredentialVault::new(b"test-vault-secret-0123456789abcd".to_vec(), 1).unwrap(),
            ),
            config: Arc::new(AppConfig::default()),
        }
    }

    fn seed_integration(deps: &AgentDeps, brand: &str, platform: &str, fields: &[(&str, &str)]) {
        let category = PlatformCategory::for_platform(platform).unwrap();
        let mut plain = HashMap::new();
        for (k, v) in fields {
            plain.insert(k.to_string(), v.to_string());
        }
        let credentials = deps.vault.encrypt_map(&plain).unwrap();
        let record = IntegrationRecord::new(brand, platform, category, credentials);
        deps.store.upsert_integration(&record).unwrap();
    }

    fn task_ctx(payload: Value) -> TaskContext {
        TaskContext {
            message_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            task_type: "test".into(),
            sender_agent_id: "test".into(),
            payload,
            trace_context: HashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn test_partial_publish_isolates_failures() {
        let deps = deps();
        seed_integration(
            &deps,
            "b-1",
            "wordpress",
            &[
                ("site_url", "https://blog.acme.example"),
                ("access_token", "wp-ok"),
            ],
        );
        seed_integration(&deps, "b-1", "linkedin", &[
            ("access_token", "revoked"),
            ("author_urn", "urn:li:person:x"),
        ]);

        let rest = RoutedRest::new(vec![
            (
                "wp-json",
                vec![RoutedRest::response(
                    201,
                    json!({"id": 5, "link": "https://blog.acme.example/?p=5"}),
                )],
            ),
            // LinkedIn 401 twice: initial call and post-"refresh" retry.
            (
                "ugcPosts",
                vec![
                    RoutedRest::response(401, json!({})),
                    RoutedRest::response(401, json!({})),
                ],
            ),
        ]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        let result = agent
            .state
            .publish_content(task_ctx(json!({
                "brand_id": "b-1",
                "platforms": ["wordpress", "linkedin"],
                "content": {"title": "T", "body": "B"},
            })))
            .await
            .unwrap();

        assert_eq!(result["status"], "partial");
        assert_eq!(result["platforms"]["wordpress"]["status"], "success");
        assert!(
            result["platforms"]["wordpress"]["url"]
                .as_str()
                .unwrap()
                .contains("?p=5")
        );
        assert_eq!(result["platforms"]["linkedin"]["status"], "error");
        assert_eq!(result["platforms"]["linkedin"]["auth_error"], true);
    }

    #[tokio::test]
    async fn test_full_success_aggregates_success() {
        let deps = deps();
        seed_integration(
            &deps,
            "b-1",
            "wordpress",
            &[
                ("site_url", "https://blog.acme.example"),
                ("access_token", "wp-ok"),
            ],
        );
        let rest = RoutedRest::new(vec![(
            "wp-json",
            vec![RoutedRest::response(201, json!({"id": 5}))],
        )]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        let result = agent
            .state
            .publish_content(task_ctx(json!({
                "brand_id": "b-1",
                "platforms": ["wordpress"],
                "content": {"title": "T", "body": "B"},
            })))
            .await
            .unwrap();
        assert_eq!(result["status"], "success");

        // The published item is tracked for monitoring.
        let tracked = deps.cache.get(tracked_key()).await.unwrap();
        assert_eq!(tracked.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_unknown_integration_not_found() {
        let deps = deps();
        let rest = RoutedRest::new(vec![]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        let result = agent
            .state
            .publish_content(task_ctx(json!({
                "brand_id": "b-1",
                "platforms": ["twitter"],
                "content": {"title": "T", "body": "B"},
            })))
            .await
            .unwrap();
        assert_eq!(result["status"], "partial");
        assert!(
            result["platforms"]["twitter"]["error"]
                .as_str()
                .unwrap()
                .contains("no twitter integration")
        );
    }

    #[tokio::test]
    async fn test_campaign_create_without_budget_conflicts() {
        let deps = deps();
        seed_integration(&deps, "b-1", "facebook_ads", &[
            ("access_token", "tok"),
            ("account_id", "111"),
        ]);
        let rest = RoutedRest::new(vec![]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        let err = agent
            .state
            .manage_campaign(task_ctx(json!({
                "brand_id": "b-1",
                "platform": "facebook_ads",
                "action": "create",
                "campaign": {"name": "No Budget", "status": "ACTIVE"},
            })))
            .await
            .unwrap_err();
        assert_eq!(err.kind, marketeer_core::ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_campaign_lifecycle_actions() {
        let deps = deps();
        seed_integration(&deps, "b-1", "facebook_ads", &[
            ("access_token", "tok"),
            ("account_id", "111"),
        ]);
        let rest = RoutedRest::new(vec![(
            "campaigns",
            vec![RoutedRest::response(200, json!({"id": "camp_7"}))],
        )]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest.clone());

        let created = agent
            .state
            .manage_campaign(task_ctx(json!({
                "brand_id": "b-1",
                "platform": "facebook_ads",
                "action": "create",
                "campaign": {"name": "Push", "daily_budget_cents": 5000},
            })))
            .await
            .unwrap();
        assert_eq!(created["action"], "create");

        let paused = agent
            .state
            .manage_campaign(task_ctx(json!({
                "brand_id": "b-1",
                "platform": "facebook_ads",
                "action": "pause",
                "campaign_id": "camp_7",
            })))
            .await
            .unwrap();
        assert_eq!(paused["action"], "pause");

        let requests = rest.requests.lock().unwrap();
        let pause_request = requests.iter().find(|r| r.url.ends_with("/camp_7")).unwrap();
        assert_eq!(pause_request.method, HttpMethod::Post);
        assert_eq!(pause_request.body.as_ref().unwrap()["status"], "PAUSED");
    }

    #[tokio::test]
    async fn test_campaign_rejects_non_ad_platform() {
        let deps = deps();
        let rest = RoutedRest::new(vec![]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        let err = agent
            .state
            .manage_campaign(task_ctx(json!({
                "brand_id": "b-1",
                "platform": "twitter",
                "action": "create",
                "campaign": {"name": "x"},
            })))
            .await
            .unwrap_err();
        assert_eq!(err.kind, marketeer_core::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_sweep_computes_deltas_and_alerts() {
        let deps = deps();
        let rest = RoutedRest::new(vec![]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        // Seed one tracked campaign directly.
        deps.cache
            .set(
                tracked_key(),
                json!([{"kind": "campaign", "platform": "facebook_ads", "external_id": "camp_1"}]),
                None,
            )
            .await;

        let first = agent.sweep_now().await.unwrap();
        assert_eq!(first["swept"], 1);
        // First sweep has no previous observation, so no deltas.
        assert!(
            first["observations"][0]["deltas"]
                .as_object()
                .unwrap()
                .is_empty()
        );

        let second = agent.sweep_now().await.unwrap();
        // Metrics are stable, so every delta is zero.
        let deltas = second["observations"][0]["deltas"].as_object().unwrap();
        assert!(!deltas.is_empty());
        assert!(deltas.values().all(|v| v.as_f64().unwrap().abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_predictive_analytics_projects_trend() {
        let deps = deps();
        let rest = RoutedRest::new(vec![]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);

        let result = agent
            .state
            .predictive_analytics(task_ctx(json!({
                "metric": "engagement_rate",
                "metric_history": [1.0, 2.0, 3.0, 4.0],
                "periods": 2,
            })))
            .await
            .unwrap();
        assert_eq!(result["trend"], "increasing");
        let projections = result["projections"].as_array().unwrap();
        assert_eq!(projections.len(), 2);
        assert!((projections[0].as_f64().unwrap() - 5.0).abs() < 1e-9);
        assert!((projections[1].as_f64().unwrap() - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_predictive_analytics_needs_history() {
        let deps = deps();
        let rest = RoutedRest::new(vec![]);
        let agent = ContentAdAgent::with_rest_client(&deps, rest);
        let err = agent
            .state
            .predictive_analytics(task_ctx(json!({"metric_history": [1.0]})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, marketeer_core::ErrorKind::Validation);
    }

    #[test]
    fn test_least_squares_flat() {
        let (slope, intercept) = least_squares(&[2.0, 2.0, 2.0]);
        assert!(slope.abs() < 1e-9);
        assert!((intercept - 2.0).abs() < 1e-9);
    }
}
