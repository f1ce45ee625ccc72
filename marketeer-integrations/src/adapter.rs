//! Adapter contract and factory.
//!
//! Every platform client implements [`IntegrationAdapter`]; verbs a
//! platform cannot express return [`AdapterOutcome::Unsupported`] rather
//! than erroring. The factory selects an implementation by platform string,
//! case-insensitively. Credentials reach an adapter already decrypted —
//! the decryption boundary is the adapter call, and plaintext must not
//! escape it.

use crate::ads::{FacebookAdsAdapter, GoogleAdsAdapter};
use crate::cms::{ShopifyAdapter, WordPressAdapter};
use crate::health::HealthCheck;
use crate::http::{RestClient, RestResponse};
use crate::social::{FacebookAdapter, InstagramAdapter, LinkedInAdapter, TwitterAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketeer_core::error::{ErrorKind, TaskError};
use marketeer_core::integration::PlatformCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// Errors from adapter calls.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("authentication failed: {message}")]
    Auth { message: String },

    #[error("rate limited: {message}")]
    RateLimited { message: String },

    #[error("upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("unsupported platform: {platform}")]
    UnsupportedPlatform { platform: String },

    #[error("invalid credentials: {message}")]
    InvalidCredentials { message: String },
}

impl AdapterError {
    /// Whether this is an auth-class failure (401/invalid token).
    pub fn is_auth(&self) -> bool {
        matches!(self, AdapterError::Auth { .. })
    }

    /// Flatten to the task error taxonomy for response envelopes.
    pub fn to_task_error(&self) -> TaskError {
        let kind = match self {
            AdapterError::Auth { .. } => ErrorKind::Auth,
            AdapterError::RateLimited { .. } | AdapterError::Upstream { .. } => ErrorKind::Upstream,
            AdapterError::Transport { .. } => ErrorKind::Transport,
            AdapterError::UnsupportedPlatform { .. } | AdapterError::InvalidCredentials { .. } => {
                ErrorKind::Validation
            }
        };
        TaskError::new(kind, self.to_string())
    }
}

/// Content in the shape adapters publish.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentPayload {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
    /// Platform-specific extras (campaign budgets, page ids, …).
    #[serde(default)]
    pub metadata: Value,
}

impl ContentPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Result of an adapter verb.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdapterOutcome {
    Success {
        external_id: Option<String>,
        url: Option<String>,
        data: Value,
    },
    /// The platform has no equivalent of this verb.
    Unsupported { verb: String },
}

impl AdapterOutcome {
    pub fn success(external_id: Option<String>, url: Option<String>, data: Value) -> Self {
        Self::Success {
            external_id,
            url,
            data,
        }
    }

    pub fn unsupported(verb: &str) -> Self {
        Self::Unsupported {
            verb: verb.to_string(),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported { .. })
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            Self::Success { external_id, .. } => external_id.as_deref(),
            Self::Unsupported { .. } => None,
        }
    }
}

pub type AdapterResult = Result<AdapterOutcome, AdapterError>;

/// Access-token provider with a refresh path, implemented by the auth
/// agent on top of the vault; adapters stay credential-storage agnostic.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn access_token(&self) -> Result<String, AdapterError>;

    /// Run one refresh exchange and return the fresh token.
    async fn refresh_access_token(&self) -> Result<String, AdapterError>;
}

/// Fixed-token source for platforms without a refresh flow (API keys,
/// application passwords). Refreshing is an auth failure.
pub struct StaticTokenSource {
    token: String,
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, AdapterError> {
        Ok(self.token.clone())
    }

    async fn refresh_access_token(&self) -> Result<String, AdapterError> {
        Err(AdapterError::Auth {
            message: "credential has no refresh flow".into(),
        })
    }
}

/// Decrypted credential fields plus the token source for one integration.
#[derive(Clone)]
pub struct AdapterContext {
    pub fields: HashMap<String, String>,
    pub tokens: Arc<dyn CredentialSource>,
}

impl AdapterContext {
    pub fn new(fields: HashMap<String, String>, tokens: Arc<dyn CredentialSource>) -> Self {
        Self { fields, tokens }
    }

    /// Context whose bearer token is a fixed field value.
    pub fn from_fields(fields: HashMap<String, String>, token_field: &str) -> Self {
        let token = fields.get(token_field).cloned().unwrap_or_default();
        Self {
            fields,
            tokens: Arc::new(StaticTokenSource::new(token)),
        }
    }

    pub fn require(&self, field: &str) -> Result<&str, AdapterError> {
        self.fields
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| AdapterError::InvalidCredentials {
                message: format!("missing credential field '{field}'"),
            })
    }
}

/// Run an authenticated call; on an auth-class failure, refresh the token
/// once inline and retry once.
pub async fn with_auth_retry<F, Fut>(
    tokens: &dyn CredentialSource,
    call: F,
) -> Result<RestResponse, AdapterError>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<RestResponse, AdapterError>>,
{
    let token = tokens.access_token().await?;
    match call(token).await {
        Err(ref e) if e.is_auth() => {
            let fresh = tokens.refresh_access_token().await?;
            call(fresh).await
        }
        other => other,
    }
}

/// Outbound client contract every platform implements.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    fn category(&self) -> PlatformCategory;

    async fn publish(&self, content: &ContentPayload) -> AdapterResult;

    async fn schedule(&self, content: &ContentPayload, when: DateTime<Utc>) -> AdapterResult;

    async fn update(&self, external_id: &str, content: &ContentPayload) -> AdapterResult;

    async fn fetch(&self, external_id: &str) -> AdapterResult;

    async fn delete(&self, external_id: &str) -> AdapterResult;

    async fn check_health(&self) -> HealthCheck;
}

/// Builds adapters by platform string.
pub struct AdapterFactory {
    rest: Arc<dyn RestClient>,
}

impl AdapterFactory {
    pub fn new(rest: Arc<dyn RestClient>) -> Self {
        Self { rest }
    }

    pub fn create(
        &self,
        platform: &str,
        ctx: AdapterContext,
    ) -> Result<Box<dyn IntegrationAdapter>, AdapterError> {
        let rest = self.rest.clone();
        match platform.to_ascii_lowercase().as_str() {
            "wordpress" => Ok(Box::new(WordPressAdapter::new(ctx, rest))),
            "shopify" => Ok(Box::new(ShopifyAdapter::new(ctx, rest))),
            "linkedin" => Ok(Box::new(LinkedInAdapter::new(ctx, rest))),
            "twitter" => Ok(Box::new(TwitterAdapter::new(ctx, rest))),
            "facebook" => Ok(Box::new(FacebookAdapter::new(ctx, rest))),
            "instagram" => Ok(Box::new(InstagramAdapter::new(ctx, rest))),
            "facebook_ads" => Ok(Box::new(FacebookAdsAdapter::new(ctx, rest))),
            "google_ads" => Ok(Box::new(GoogleAdsAdapter::new(ctx, rest))),
            other => Err(AdapterError::UnsupportedPlatform {
                platform: other.to_string(),
            }),
        }
    }

    /// Required credential fields per platform, used by setup validation.
    pub fn required_fields(platform: &str) -> Result<&'static [&'static str], AdapterError> {
        match platform.to_ascii_lowercase().as_str() {
            "wordpress" => Ok(&["site_url", "access_token"]),
            "shopify" => Ok(&["shop_domain", "access_token"]),
            "linkedin" => Ok(&["access_token", "author_urn"]),
            "twitter" => Ok(&["access_token"]),
            "facebook" => Ok(&["access_token", "page_id"]),
            "instagram" => Ok(&["access_token", "ig_user_id"]),
            "facebook_ads" => Ok(&["access_token", "account_id"]),
            "google_ads" => Ok(&["access_token", "customer_id", "developer_token"]),
            other => Err(AdapterError::UnsupportedPlatform {
                platform: other.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::RestRequest;

    struct NullRest;

    #[async_trait]
    impl RestClient for NullRest {
        async fn execute(
            &self,
            _category: PlatformCategory,
            _request: RestRequest,
        ) -> Result<RestResponse, AdapterError> {
            Ok(RestResponse {
                status: 200,
                body: Value::Null,
            })
        }
    }

    fn ctx() -> AdapterContext {
        let mut fields = HashMap::new();
        for field in [
            "site_url",
            "shop_domain",
            "access_token",
            "author_urn",
            "page_id",
            "ig_user_id",
            "account_id",
            "customer_id",
            "developer_token",
        ] {
            fields.insert(field.to_string(), format!("{field}-value"));
        }
        AdapterContext::from_fields(fields, "access_token")
    }

    #[test]
    fn test_factory_is_case_insensitive() {
        let factory = AdapterFactory::new(Arc::new(NullRest));
        for platform in ["WordPress", "LINKEDIN", "shopify", "Facebook_Ads"] {
            let adapter = factory.create(platform, ctx()).unwrap();
            assert_eq!(
                adapter.platform(),
                platform.to_ascii_lowercase(),
                "platform tag mismatch for {platform}"
            );
        }
    }

    #[test]
    fn test_factory_rejects_unknown_platform() {
        let factory = AdapterFactory::new(Arc::new(NullRest));
        assert!(matches!(
            factory.create("myspace", ctx()),
            Err(AdapterError::UnsupportedPlatform { .. })
        ));
    }

    #[test]
    fn test_factory_categories() {
        let factory = AdapterFactory::new(Arc::new(NullRest));
        assert_eq!(
            factory.create("wordpress", ctx()).unwrap().category(),
            PlatformCategory::Cms
        );
        assert_eq!(
            factory.create("twitter", ctx()).unwrap().category(),
            PlatformCategory::Social
        );
        assert_eq!(
            factory.create("google_ads", ctx()).unwrap().category(),
            PlatformCategory::Advertising
        );
    }

    #[test]
    fn test_required_fields_cover_every_platform() {
        for platform in [
            "wordpress",
            "shopify",
            "linkedin",
            "twitter",
            "facebook",
            "instagram",
            "facebook_ads",
            "google_ads",
        ] {
            let fields = AdapterFactory::required_fields(platform).unwrap();
            assert!(!fields.is_empty());
        }
        assert!(AdapterFactory::required_fields("myspace").is_err());
    }

    #[test]
    fn test_adapter_error_task_mapping() {
        assert_eq!(
            AdapterError::Auth {
                message: "401".into()
            }
            .to_task_error()
            .kind,
            ErrorKind::Auth
        );
        assert_eq!(
            AdapterError::Upstream {
                status: 404,
                message: String::new()
            }
            .to_task_error()
            .kind,
            ErrorKind::Upstream
        );
        assert_eq!(
            AdapterError::Transport {
                message: "reset".into()
            }
            .to_task_error()
            .kind,
            ErrorKind::Transport
        );
    }

    #[tokio::test]
    async fn test_with_auth_retry_refreshes_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct RefreshingSource {
            refreshes: AtomicUsize,
        }

        #[async_trait]
        impl CredentialSource for RefreshingSource {
            async fn access_token(&self) -> Result<String, AdapterError> {
                Ok("stale".into())
            }
            async fn refresh_access_token(&self) -> Result<String, AdapterError> {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".into())
            }
        }

        let source = RefreshingSource {
            refreshes: AtomicUsize::new(0),
        };
        let result = with_auth_retry(&source, |token| async move {
            if token == "stale" {
                Err(AdapterError::Auth {
                    message: "401".into(),
                })
            } else {
                Ok(RestResponse {
                    status: 201,
                    body: Value::Null,
                })
            }
        })
        .await
        .unwrap();
        assert_eq!(result.status, 201);
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_static_source_cannot_refresh() {
        let source = StaticTokenSource::new("fixed");
        assert_eq!(source.access_token().await.unwrap(), "fixed");
        assert!(source.refresh_access_token().await.is_err());
    }
}
