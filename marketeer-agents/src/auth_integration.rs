//! Auth & integration agent — OAuth flows, credential setup, token
//! refresh, and background integration health monitoring.
//!
//! Setup, refresh, and health checks for a given (brand, platform) pair
//! serialize on a keyed mutex; concurrent refresh attempts coalesce into a
//! single in-flight exchange whose result every waiter shares. A refresh
//! failure marks the integration degraded; a second consecutive failure
//! marks it unhealthy and emits `integration.error`.

use crate::AgentDeps;
use chrono::{DateTime, Utc};
use marketeer_core::audit::AuditEntry;
use marketeer_core::auth::{HttpTokenEndpoint, OAuthClient, SessionTokens, provider_registry_from_env};
use marketeer_core::cache::Cache;
use marketeer_core::error::{AgentError, TaskError};
use marketeer_core::integration::{HealthStatus, IntegrationRecord, PlatformCategory};
use marketeer_core::runtime::{Agent, AgentConfig, BaseAgent, EventContext, TaskContext, TaskOutcome};
use marketeer_core::sync::{KeyedMutex, SingleFlight};
use marketeer_core::vault::CredentialVault;
use marketeer_core::webhooks::WebhookDispatcher;
use marketeer_integrations::{
    AdapterContext, AdapterFactory, HealthCheck, ReqwestRestClient, RestClient, RetrySchedule,
    StaticTokenSource,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

type RefreshOutcome = Result<RefreshedToken, String>;

#[derive(Debug, Clone)]
struct RefreshedToken {
    access_token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// The OAuth provider backing a platform's refresh exchange, when one
/// exists. CMS and API-key platforms have no refresh flow.
fn refresh_provider(platform: &str) -> Option<&'static str> {
    match platform.to_ascii_lowercase().as_str() {
        "linkedin" => Some("linkedin"),
        "facebook" | "instagram" | "facebook_ads" => Some("facebook"),
        "google_ads" => Some("google"),
        _ => None,
    }
}

struct AuthState {
    base: BaseAgent,
    store: Arc<marketeer_core::Store>,
    vault: Arc<CredentialVault>,
    cache: Arc<dyn Cache>,
    oauth: OAuthClient,
    sessions: Option<SessionTokens>,
    factory: AdapterFactory,
    webhooks: Arc<WebhookDispatcher>,
    /// Serializes setup/refresh/health per (brand, platform).
    locks: KeyedMutex<(String, String)>,
    /// Coalesces concurrent refreshes per (brand, platform).
    refreshes: SingleFlight<(String, String), RefreshOutcome>,
}

/// The auth & integration agent.
pub struct AuthIntegrationAgent {
    base: BaseAgent,
    state: Arc<AuthState>,
}

impl AuthIntegrationAgent {
    pub const AGENT_ID: &'static str = "auth_integration";

    pub fn new(deps: &AgentDeps, webhooks: Arc<WebhookDispatcher>) -> Self {
        let rest: Arc<dyn RestClient> = Arc::new(ReqwestRestClient::new(
            RetrySchedule::default(),
            deps.config.rate_limits.clone(),
        ));
        let oauth = OAuthClient::new(
            provider_registry_from_env(),
            Arc::new(HttpTokenEndpoint::new()),
        );
        Self::with_seams(deps, webhooks, rest, oauth)
    }

    pub fn with_seams(
        deps: &AgentDeps,
        webhooks: Arc<WebhookDispatcher>,
        rest: Arc<dyn RestClient>,
        oauth: OAuthClient,
    ) -> Self {
        let base = BaseAgent::new(
            AgentConfig::new(Self::AGENT_ID, "Auth & Integration Agent"),
            deps.broker.clone(),
        );
        let sessions = if deps.config.jwt.secret.is_empty() {
            None
        } else {
            SessionTokens::new(
                &deps.config.jwt.secret,
                &deps.config.jwt.algorithm,
                deps.config.jwt.expiry_secs,
            )
            .ok()
        };
        let state = Arc::new(AuthState {
            base: base.clone(),
            store: deps.store.clone(),
            vault: deps.vault.clone(),
            cache: deps.cache.clone(),
            oauth,
            sessions,
            factory: AdapterFactory::new(rest),
            webhooks,
            locks: KeyedMutex::new(),
            refreshes: SingleFlight::new(),
        });

        macro_rules! task {
            ($name:literal, $method:ident) => {{
                let st = state.clone();
                base.register_task_handler($name, move |ctx| {
                    let st = st.clone();
                    async move { st.$method(ctx).await }
                });
            }};
        }
        task!("authenticate_user", authenticate_user);
        task!("create_oauth_url", create_oauth_url);
        task!("setup_platform_integration", setup_integration);
        task!("refresh_oauth_token", refresh_token_task);
        task!("check_integration_health", check_health_task);
        task!("get_integration_status", get_status);

        let st = state.clone();
        base.register_event_handler("integration.failure", move |ctx| {
            let st = st.clone();
            async move { st.on_integration_failure(ctx).await }
        });

        let st = state.clone();
        let interval = Duration::from_secs(deps.config.agents.health_check_interval_secs);
        base.register_timer("integration_health", interval, move || {
            let st = st.clone();
            async move { st.health_sweep().await }
        });

        Self { base, state }
    }

    pub fn base(&self) -> &BaseAgent {
        &self.base
    }

    /// Run one health sweep immediately (the timer path runs the same code).
    pub async fn sweep_now(&self) {
        self.state.health_sweep().await;
    }
}

#[async_trait::async_trait]
impl Agent for AuthIntegrationAgent {
    fn agent_id(&self) -> &str {
        Self::AGENT_ID
    }

    fn name(&self) -> &str {
        "Auth & Integration Agent"
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

/// Normalize a provider's user-info document to `{id, name, email}`.
fn normalize_user(provider: &str, info: &Value) -> Value {
    let id = info
        .get("sub")
        .or_else(|| info.get("id"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    let name = info
        .get("name")
        .and_then(|v| v.as_str())
        .map(String::from)
        .or_else(|| {
            // LinkedIn splits the display name.
            let first = info.get("localizedFirstName").and_then(|v| v.as_str());
            let last = info.get("localizedLastName").and_then(|v| v.as_str());
            match (first, last) {
                (Some(f), Some(l)) => Some(format!("{f} {l}")),
                (Some(f), None) => Some(f.to_string()),
                _ => None,
            }
        })
        .unwrap_or_default();
    json!({
        "id": id,
        "name": name,
        "email": info.get("email").and_then(|v| v.as_str()),
        "provider": provider,
    })
}

impl AuthState {
    fn audit(&self, user: &str, action: &str, resource_type: &str, resource_id: &str) {
        let entry = AuditEntry::new(user, action, resource_type, resource_id)
            .with_agent(AuthIntegrationAgent::AGENT_ID);
        if let Err(e) = self.store.insert_audit(&entry) {
            debug!(error = %e, "audit insert failed");
        }
    }

    // -- OAuth / user auth ---------------------------------------------------

    async fn authenticate_user(&self, ctx: TaskContext) -> TaskOutcome {
        let provider = ctx.require_str("provider")?.to_lowercase();
        let auth_code = ctx.require_str("auth_code")?;
        let redirect_uri = ctx.require_str("redirect_uri")?;

        let token = self
            .oauth
            .exchange_code(&provider, auth_code, redirect_uri)
            .await
            .map_err(|e| TaskError::auth(e.to_string()))?;
        let info = self
            .oauth
            .user_info(&provider, &token.access_token)
            .await
            .map_err(|e| TaskError::auth(e.to_string()))?;
        let user = normalize_user(&provider, &info);
        let user_id = user["id"].as_str().unwrap_or_default().to_string();

        // Provider tokens are ephemeral session state, not integrations.
        self.cache
            .set(
                &format!("oauth_tokens:{provider}:{user_id}"),
                json!({
                    "access_token": token.access_token,
                    "refresh_token": token.refresh_token,
                    "expires_at": token.expires_at,
                }),
                None,
            )
            .await;

        let session_token = match &self.sessions {
            Some(sessions) => Some(
                sessions
                    .issue(&user_id, &provider)
                    .map_err(|e| TaskError::internal(e.to_string()))?,
            ),
            None => None,
        };

        self.audit(&user_id, "user_authenticated", "user", &user_id);
        Ok(json!({
            "user": user,
            "token": session_token,
            "token_expires_at": token.expires_at,
        }))
    }

    async fn create_oauth_url(&self, ctx: TaskContext) -> TaskOutcome {
        let provider = ctx.require_str("provider")?.to_lowercase();
        let redirect_uri = ctx.require_str("redirect_uri")?;
        let state = ctx.optional_str("state");
        let scopes: Option<Vec<String>> = ctx
            .payload
            .get("scope")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            });

        let config = self
            .oauth
            .provider(&provider)
            .map_err(|e| TaskError::validation(e.to_string()))?;
        let url = config.authorization_url(redirect_uri, state, scopes.as_deref());
        Ok(json!({"provider": provider, "authorization_url": url}))
    }

    // -- integration setup ---------------------------------------------------

    async fn setup_integration(&self, ctx: TaskContext) -> TaskOutcome {
        let platform = ctx.require_str("platform")?.to_lowercase();
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let category = PlatformCategory::for_platform(&platform).ok_or_else(|| {
            TaskError::validation(format!("unsupported platform '{platform}'"))
        })?;
        let credentials: HashMap<String, String> = ctx
            .payload
            .get("credentials")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .ok_or_else(|| TaskError::validation("missing required field 'credentials'"))?;

        // Category-specific required fields, checked before anything
        // persists.
        let required = AdapterFactory::required_fields(&platform)
            .map_err(|e| TaskError::validation(e.to_string()))?;
        let missing: Vec<&str> = required
            .iter()
            .filter(|f| !credentials.contains_key(**f))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(TaskError::validation(format!(
                "missing credential fields for {platform}: {missing:?}"
            )));
        }

        let _guard = self
            .locks
            .lock((brand_id.clone(), platform.clone()))
            .await;

        let token_expires_at = credentials
            .get("expires_at")
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok());
        let encrypted = self.vault.encrypt_map(&credentials)?;

        // A re-setup replaces the stored credentials for the pair.
        let mut record = match self
            .store
            .get_integration_by_brand_platform(&brand_id, &platform)?
        {
            Some(mut existing) => {
                existing.credentials = encrypted;
                existing.health_status = HealthStatus::Pending;
                existing.consecutive_failures = 0;
                existing
            }
            None => IntegrationRecord::new(&brand_id, &platform, category, encrypted),
        };
        record.token_expires_at = token_expires_at;
        record.updated_at = Utc::now();
        self.store.upsert_integration(&record)?;

        self.audit(
            &user_id,
            "integration_created",
            "integration",
            &record.integration_id.to_string(),
        );
        info!(brand_id, platform, integration_id = %record.integration_id, "integration set up");
        Ok(json!({
            "integration_id": record.integration_id,
            "brand_id": brand_id,
            "platform": platform,
            "category": category,
            "health_status": record.health_status,
        }))
    }

    // -- token refresh -------------------------------------------------------

    async fn refresh_token_task(&self, ctx: TaskContext) -> TaskOutcome {
        // Two shapes: a user-session refresh (provider + user_id) or an
        // integration refresh (brand_id + platform).
        if let (Some(provider), Some(user_id)) =
            (ctx.optional_str("provider"), ctx.optional_str("user_id"))
        {
            return self.refresh_user_token(provider, user_id).await;
        }
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let platform = ctx.require_str("platform")?.to_lowercase();

        match self.coalesced_refresh(&brand_id, &platform).await {
            Ok(token) => Ok(json!({
                "brand_id": brand_id,
                "platform": platform,
                "access_token": token.access_token,
                "expires_at": token.expires_at,
            })),
            Err(detail) => Err(TaskError::auth(detail)),
        }
    }

    async fn refresh_user_token(&self, provider: &str, user_id: &str) -> TaskOutcome {
        let key = format!("oauth_tokens:{provider}:{user_id}");
        let stored = self
            .cache
            .get(&key)
            .await
            .ok_or_else(|| TaskError::not_found(format!("no stored tokens for {user_id}")))?;
        let refresh_token = stored
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TaskError::auth("stored token has no refresh_token"))?;

        let token = self
            .oauth
            .refresh(provider, refresh_token)
            .await
            .map_err(|e| TaskError::auth(e.to_string()))?;
        self.cache
            .set(
                &key,
                json!({
                    "access_token": token.access_token,
                    "refresh_token": token.refresh_token,
                    "expires_at": token.expires_at,
                }),
                None,
            )
            .await;
        self.audit(user_id, "token_refreshed", "user", user_id);
        Ok(json!({
            "access_token": token.access_token,
            "expires_at": token.expires_at,
        }))
    }

    /// Single-flight integration refresh: the caller landing first runs the
    /// exchange, the rest share its result.
    async fn coalesced_refresh(&self, brand_id: &str, platform: &str) -> RefreshOutcome {
        let key = (brand_id.to_string(), platform.to_string());
        self.refreshes
            .run(key, || self.run_refresh(brand_id.to_string(), platform.to_string()))
            .await
    }

    async fn run_refresh(&self, brand_id: String, platform: String) -> RefreshOutcome {
        let _guard = self.locks.lock((brand_id.clone(), platform.clone())).await;

        let record = self
            .store
            .get_integration_by_brand_platform(&brand_id, &platform)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no {platform} integration for brand '{brand_id}'"))?;

        let provider = match refresh_provider(&platform) {
            Some(provider) => provider,
            None => return Err(format!("{platform} credentials have no refresh flow")),
        };
        let mut fields = self
            .vault
            .decrypt_map(&record.credentials)
            .map_err(|e| e.to_string())?;
        let refresh_token = match fields.get("refresh_token") {
            Some(token) => token.clone(),
            None => return Err("stored credentials carry no refresh_token".to_string()),
        };

        match self.oauth.refresh(provider, &refresh_token).await {
            Ok(token) => {
                fields.insert("access_token".to_string(), token.access_token.clone());
                if let Some(new_refresh) = &token.refresh_token {
                    fields.insert("refresh_token".to_string(), new_refresh.clone());
                }
                if let Some(expires) = token.expires_at {
                    fields.insert("expires_at".to_string(), expires.to_rfc3339());
                }

                let mut updated = record;
                updated.credentials = self.vault.encrypt_map(&fields).map_err(|e| e.to_string())?;
                updated.token_expires_at = token.expires_at;
                updated.consecutive_failures = 0;
                updated.updated_at = Utc::now();
                self.store
                    .upsert_integration(&updated)
                    .map_err(|e| e.to_string())?;

                self.audit(
                    "system",
                    "token_refreshed",
                    "integration",
                    &updated.integration_id.to_string(),
                );
                info!(brand_id, platform, "token refreshed");
                Ok(RefreshedToken {
                    access_token: token.access_token,
                    expires_at: token.expires_at,
                })
            }
            Err(e) => {
                // First failure degrades, the second marks unhealthy and
                // raises integration.error.
                let mut updated = record;
                updated.consecutive_failures += 1;
                updated.health_status = if updated.consecutive_failures >= 2 {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Degraded
                };
                updated.updated_at = Utc::now();
                if let Err(store_err) = self.store.upsert_integration(&updated) {
                    warn!(error = %store_err, "failed to persist refresh failure");
                }
                if updated.health_status == HealthStatus::Unhealthy && self.base.is_running() {
                    let payload = json!({
                        "integration_id": updated.integration_id,
                        "brand_id": brand_id,
                        "platform": platform,
                        "reason": "token refresh failed twice",
                    });
                    if let Err(broadcast_err) =
                        self.base.broadcast_event("integration.error", payload).await
                    {
                        warn!(error = %broadcast_err, "integration.error broadcast failed");
                    }
                }
                warn!(brand_id, platform, error = %e, "token refresh failed");
                Err(e.to_string())
            }
        }
    }

    // -- health checks -------------------------------------------------------

    async fn check_health_task(&self, ctx: TaskContext) -> TaskOutcome {
        let targets = if ctx
            .payload
            .get("check_all")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            self.store.all_integrations()?
        } else {
            let raw = ctx.require_str("integration_id")?;
            let id: Uuid = raw
                .parse()
                .map_err(|_| TaskError::validation(format!("'{raw}' is not an integration id")))?;
            vec![
                self.store
                    .get_integration(id)?
                    .ok_or_else(|| TaskError::not_found(format!("integration '{raw}' not found")))?,
            ]
        };

        let mut results = Vec::new();
        for record in targets {
            let check = self.check_one(&record).await;
            results.push(json!({
                "integration_id": record.integration_id,
                "platform": record.platform,
                "status": check.status,
                "response_time_ms": check.response_time_ms,
                "auth_error": check.auth_error,
                "error_message": check.error_message,
            }));
        }
        Ok(json!({"checked": results.len(), "results": results}))
    }

    /// Check one integration: probe, persist the history row and record
    /// update atomically, and react to an unhealthy transition.
    async fn check_one(&self, record: &IntegrationRecord) -> HealthCheck {
        let _guard = self
            .locks
            .lock((record.brand_id.clone(), record.platform.clone()))
            .await;

        let check = match self.vault.decrypt_map(&record.credentials) {
            Ok(fields) => {
                let token = fields.get("access_token").cloned().unwrap_or_default();
                let ctx = AdapterContext::new(fields, Arc::new(StaticTokenSource::new(token)));
                match self.factory.create(&record.platform, ctx) {
                    Ok(adapter) => adapter.check_health().await,
                    Err(e) => HealthCheck::from_transport_error(e.to_string(), 0),
                }
            }
            Err(e) => HealthCheck::from_transport_error(format!("decrypt failed: {e}"), 0),
        };

        let was_unhealthy = record.health_status == HealthStatus::Unhealthy;
        let consecutive_failures = if check.is_healthy() {
            0
        } else {
            record.consecutive_failures + 1
        };
        if let Err(e) = self.store.record_health_check(
            record,
            &check.to_record(record.integration_id),
            consecutive_failures,
        ) {
            warn!(integration_id = %record.integration_id, error = %e, "health persist failed");
        }

        // The repair path re-acquires the pair lock for itself.
        drop(_guard);

        if check.status == HealthStatus::Unhealthy && !was_unhealthy {
            let payload = json!({
                "integration_id": record.integration_id,
                "brand_id": record.brand_id,
                "platform": record.platform,
                "auth_error": check.auth_error,
                "error_message": check.error_message,
            });
            // Repair inline for auth failures, then tell the world.
            if check.auth_error {
                if let Err(e) = self
                    .coalesced_refresh(&record.brand_id, &record.platform)
                    .await
                {
                    debug!(platform = %record.platform, error = %e, "inline repair failed");
                }
            }
            if self.base.is_running()
                && let Err(e) = self
                    .base
                    .broadcast_event("integration.failure", payload)
                    .await
            {
                warn!(error = %e, "integration.failure broadcast failed");
            }
        }
        check
    }

    /// Periodic sweep: refresh expiring tokens, then health-check every
    /// integration.
    async fn health_sweep(&self) {
        let records = match self.store.all_integrations() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "health sweep cannot list integrations");
                return;
            }
        };
        let now = Utc::now();
        for record in &records {
            if record.token_needs_refresh(now) && refresh_provider(&record.platform).is_some() {
                if let Err(e) = self
                    .coalesced_refresh(&record.brand_id, &record.platform)
                    .await
                {
                    debug!(platform = %record.platform, error = %e, "scheduled refresh failed");
                }
            }
        }
        for record in &records {
            let _ = self.check_one(record).await;
        }
        debug!(count = records.len(), "health sweep finished");
    }

    // -- status --------------------------------------------------------------

    async fn get_status(&self, ctx: TaskContext) -> TaskOutcome {
        let records = if let Some(raw) = ctx.optional_str("integration_id") {
            let id: Uuid = raw
                .parse()
                .map_err(|_| TaskError::validation(format!("'{raw}' is not an integration id")))?;
            vec![
                self.store
                    .get_integration(id)?
                    .ok_or_else(|| TaskError::not_found(format!("integration '{raw}' not found")))?,
            ]
        } else if let Some(brand_id) = ctx.optional_str("brand_id") {
            self.store.integrations_for_brand(brand_id)?
        } else {
            self.store.all_integrations()?
        };

        let statuses: Vec<Value> = records
            .iter()
            .map(|record| {
                json!({
                    "integration_id": record.integration_id,
                    "brand_id": record.brand_id,
                    "platform": record.platform,
                    "category": record.category,
                    "health_status": record.health_status,
                    "last_health_check": record.last_health_check,
                    "token_expires_at": record.token_expires_at,
                })
            })
            .collect();
        Ok(json!({"count": statuses.len(), "integrations": statuses}))
    }

    // -- events --------------------------------------------------------------

    /// Automatic repair on a broadcast failure; a user-visible webhook
    /// notification goes out only when repair does not help.
    async fn on_integration_failure(&self, ctx: EventContext) {
        let brand_id = ctx.payload.get("brand_id").and_then(|v| v.as_str());
        let platform = ctx.payload.get("platform").and_then(|v| v.as_str());
        let auth_error = ctx
            .payload
            .get("auth_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let (Some(brand_id), Some(platform)) = (brand_id, platform) else {
            return;
        };

        let repaired = auth_error
            && self
                .coalesced_refresh(brand_id, platform)
                .await
                .is_ok();
        if repaired {
            info!(brand_id, platform, "integration repaired after failure event");
            return;
        }

        if let Err(e) = self
            .webhooks
            .trigger_event(brand_id, "integration.failure", &ctx.payload)
        {
            warn!(brand_id, error = %e, "failure notification dispatch failed");
        }
    }
}
