//! Social adapters — LinkedIn, Twitter, Facebook, Instagram.
//!
//! Verb coverage is uneven across platforms: LinkedIn and Twitter cannot
//! edit a published post, Instagram cannot schedule or delete through the
//! API. Unsupported verbs return [`AdapterOutcome::Unsupported`], not
//! errors.

use crate::adapter::{
    AdapterContext, AdapterOutcome, AdapterResult, ContentPayload, IntegrationAdapter,
    with_auth_retry,
};
use crate::health::{HealthCheck, probe};
use crate::http::{HttpMethod, RestClient, RestRequest, ensure_success};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketeer_core::integration::PlatformCategory;
use serde_json::json;
use std::sync::Arc;

const GRAPH_BASE: &str = "https://graph.facebook.com/v18.0";
const TWEET_MAX_CHARS: usize = 280;

// ---------------------------------------------------------------------------
// LinkedIn
// ---------------------------------------------------------------------------

pub struct LinkedInAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl LinkedInAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }
}

#[async_trait]
impl IntegrationAdapter for LinkedInAdapter {
    fn platform(&self) -> &'static str {
        "linkedin"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Social
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let author = self.ctx.require("author_urn")?.to_string();
        let body = json!({
            "author": author,
            "lifecycleState": "PUBLISHED",
            "specificContent": {
                "com.linkedin.ugc.ShareContent": {
                    "shareCommentary": {"text": content.body},
                    "shareMediaCategory": "NONE",
                }
            },
            "visibility": {"com.linkedin.ugc.MemberNetworkVisibility": "PUBLIC"},
        });
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(
                HttpMethod::Post,
                "https://api.linkedin.com/v2/ugcPosts",
                "linkedin",
            )
            .bearer(token)
            .header("X-Restli-Protocol-Version", "2.0.0")
            .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;

        let id = response.str_field("/id");
        let url = id
            .as_deref()
            .map(|id| format!("https://www.linkedin.com/feed/update/{id}"));
        Ok(AdapterOutcome::success(id, url, response.body))
    }

    async fn schedule(&self, _content: &ContentPayload, _when: DateTime<Utc>) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("schedule"))
    }

    async fn update(&self, _external_id: &str, _content: &ContentPayload) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("update"))
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let url = format!(
            "https://api.linkedin.com/v2/ugcPosts/{}",
            urlencoding::encode(external_id)
        );
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Get, url.as_str(), "linkedin")
                .bearer(token)
                .header("X-Restli-Protocol-Version", "2.0.0");
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn delete(&self, external_id: &str) -> AdapterResult {
        let url = format!(
            "https://api.linkedin.com/v2/ugcPosts/{}",
            urlencoding::encode(external_id)
        );
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Delete, url.as_str(), "linkedin")
                .bearer(token)
                .header("X-Restli-Protocol-Version", "2.0.0");
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request = RestRequest::new(HttpMethod::Get, "https://api.linkedin.com/v2/me", "linkedin")
            .bearer(token);
        probe(&*self.rest, PlatformCategory::Social, request).await
    }
}

// ---------------------------------------------------------------------------
// Twitter
// ---------------------------------------------------------------------------

pub struct TwitterAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl TwitterAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }

    fn tweet_text(content: &ContentPayload) -> String {
        let text = if content.body.is_empty() {
            &content.title
        } else {
            &content.body
        };
        text.chars().take(TWEET_MAX_CHARS).collect()
    }
}

#[async_trait]
impl IntegrationAdapter for TwitterAdapter {
    fn platform(&self) -> &'static str {
        "twitter"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Social
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let body = json!({"text": Self::tweet_text(content)});
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request =
                RestRequest::new(HttpMethod::Post, "https://api.twitter.com/2/tweets", "twitter")
                    .bearer(token)
                    .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;

        let id = response.str_field("/data/id");
        let url = id.as_deref().map(|id| format!("https://twitter.com/i/status/{id}"));
        Ok(AdapterOutcome::success(id, url, response.body))
    }

    async fn schedule(&self, _content: &ContentPayload, _when: DateTime<Utc>) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("schedule"))
    }

    async fn update(&self, _external_id: &str, _content: &ContentPayload) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("update"))
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let url = format!("https://api.twitter.com/2/tweets/{external_id}");
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Get, url.as_str(), "twitter").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn delete(&self, external_id: &str) -> AdapterResult {
        let url = format!("https://api.twitter.com/2/tweets/{external_id}");
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Delete, url.as_str(), "twitter").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request =
            RestRequest::new(HttpMethod::Get, "https://api.twitter.com/2/users/me", "twitter")
                .bearer(token);
        probe(&*self.rest, PlatformCategory::Social, request).await
    }
}

// ---------------------------------------------------------------------------
// Facebook (pages)
// ---------------------------------------------------------------------------

pub struct FacebookAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl FacebookAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }
}

#[async_trait]
impl IntegrationAdapter for FacebookAdapter {
    fn platform(&self) -> &'static str {
        "facebook"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Social
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let page_id = self.ctx.require("page_id")?.to_string();
        let url = format!("{GRAPH_BASE}/{page_id}/feed");
        let body = json!({"message": content.body});
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "facebook")
                .bearer(token)
                .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            response.str_field("/id"),
            None,
            response.body,
        ))
    }

    async fn schedule(&self, content: &ContentPayload, when: DateTime<Utc>) -> AdapterResult {
        let page_id = self.ctx.require("page_id")?.to_string();
        let url = format!("{GRAPH_BASE}/{page_id}/feed");
        let body = json!({
            "message": content.body,
            "published": false,
            "scheduled_publish_time": when.timestamp(),
        });
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "facebook")
                .bearer(token)
                .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            response.str_field("/id"),
            None,
            response.body,
        ))
    }

    async fn update(&self, external_id: &str, content: &ContentPayload) -> AdapterResult {
        let url = format!("{GRAPH_BASE}/{external_id}");
        let body = json!({"message": content.body});
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "facebook")
                .bearer(token)
                .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let url = format!("{GRAPH_BASE}/{external_id}");
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Get, url.as_str(), "facebook").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn delete(&self, external_id: &str) -> AdapterResult {
        let url = format!("{GRAPH_BASE}/{external_id}");
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Delete, url.as_str(), "facebook").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request =
            RestRequest::new(HttpMethod::Get, format!("{GRAPH_BASE}/me"), "facebook").bearer(token);
        probe(&*self.rest, PlatformCategory::Social, request).await
    }
}

// ---------------------------------------------------------------------------
// Instagram
// ---------------------------------------------------------------------------

pub struct InstagramAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl InstagramAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }
}

#[async_trait]
impl IntegrationAdapter for InstagramAdapter {
    fn platform(&self) -> &'static str {
        "instagram"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Social
    }

    /// Two-step publish: create a media container, then publish it.
    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let ig_user = self.ctx.require("ig_user_id")?.to_string();
        let image_url = content.media_urls.first().cloned().ok_or_else(|| {
            crate::adapter::AdapterError::InvalidCredentials {
                message: "instagram publishing requires a media URL".into(),
            }
        })?;

        let container_url = format!("{GRAPH_BASE}/{ig_user}/media");
        let container_body = json!({"caption": content.body, "image_url": image_url});
        let container = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, container_url.as_str(), "instagram")
                .bearer(token)
                .json(container_body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        let creation_id = container.str_field("/id").ok_or_else(|| {
            crate::adapter::AdapterError::Upstream {
                status: 200,
                message: "container response missing id".into(),
            }
        })?;

        let publish_url = format!("{GRAPH_BASE}/{ig_user}/media_publish");
        let publish_body = json!({"creation_id": creation_id});
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, publish_url.as_str(), "instagram")
                .bearer(token)
                .json(publish_body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            response.str_field("/id"),
            None,
            response.body,
        ))
    }

    async fn schedule(&self, _content: &ContentPayload, _when: DateTime<Utc>) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("schedule"))
    }

    async fn update(&self, _external_id: &str, _content: &ContentPayload) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("update"))
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let url = format!("{GRAPH_BASE}/{external_id}?fields=id,caption,permalink,timestamp");
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Get, url.as_str(), "instagram").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Social, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            response.str_field("/permalink"),
            response.body,
        ))
    }

    async fn delete(&self, _external_id: &str) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("delete"))
    }

    async fn check_health(&self) -> HealthCheck {
        let ig_user = match self.ctx.require("ig_user_id") {
            Ok(id) => id.to_string(),
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request = RestRequest::new(
            HttpMethod::Get,
            format!("{GRAPH_BASE}/{ig_user}?fields=id"),
            "instagram",
        )
        .bearer(token);
        probe(&*self.rest, PlatformCategory::Social, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, CredentialSource};
    use crate::http::RestResponse;
    use marketeer_core::integration::HealthStatus;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRest {
        responses: Mutex<Vec<Result<RestResponse, AdapterError>>>,
        requests: Mutex<Vec<RestRequest>>,
    }

    impl ScriptedRest {
        fn new(responses: Vec<Result<RestResponse, AdapterError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn ok(status: u16, body: serde_json::Value) -> Result<RestResponse, AdapterError> {
            Ok(RestResponse { status, body })
        }
    }

    #[async_trait]
    impl RestClient for ScriptedRest {
        async fn execute(
            &self,
            _category: PlatformCategory,
            request: RestRequest,
        ) -> Result<RestResponse, AdapterError> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok(RestResponse {
                    status: 200,
                    body: serde_json::Value::Null,
                });
            }
            responses.remove(0)
        }
    }

    fn social_ctx(extra: &[(&str, &str)]) -> AdapterContext {
        let mut fields = HashMap::new();
        fields.insert("access_token".to_string(), "tok".to_string());
        for (k, v) in extra {
            fields.insert(k.to_string(), v.to_string());
        }
        AdapterContext::from_fields(fields, "access_token")
    }

    #[tokio::test]
    async fn test_linkedin_publish_builds_ugc_post() {
        let rest = ScriptedRest::new(vec![ScriptedRest::ok(
            201,
            json!({"id": "urn:li:share:123"}),
        )]);
        let adapter = LinkedInAdapter::new(
            social_ctx(&[("author_urn", "urn:li:person:abc")]),
            rest.clone(),
        );
        let outcome = adapter
            .publish(&ContentPayload::new("", "Hello network"))
            .await
            .unwrap();
        assert_eq!(outcome.external_id(), Some("urn:li:share:123"));

        let requests = rest.requests.lock().unwrap();
        assert_eq!(requests[0].url, "https://api.linkedin.com/v2/ugcPosts");
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["author"], "urn:li:person:abc");
        assert!(
            requests[0]
                .headers
                .iter()
                .any(|(n, v)| n == "X-Restli-Protocol-Version" && v == "2.0.0")
        );
    }

    #[tokio::test]
    async fn test_linkedin_unsupported_verbs() {
        let rest = ScriptedRest::new(vec![]);
        let adapter =
            LinkedInAdapter::new(social_ctx(&[("author_urn", "urn:li:person:abc")]), rest);
        assert!(
            adapter
                .schedule(&ContentPayload::default(), Utc::now())
                .await
                .unwrap()
                .is_unsupported()
        );
        assert!(
            adapter
                .update("id", &ContentPayload::default())
                .await
                .unwrap()
                .is_unsupported()
        );
    }

    #[tokio::test]
    async fn test_linkedin_401_refreshes_then_succeeds() {
        struct CountingSource {
            refreshes: AtomicUsize,
        }

        #[async_trait]
        impl CredentialSource for CountingSource {
            async fn access_token(&self) -> Result<String, AdapterError> {
                Ok("stale".into())
            }
            async fn refresh_access_token(&self) -> Result<String, AdapterError> {
                self.refreshes.fetch_add(1, Ordering::SeqCst);
                Ok("fresh".into())
            }
        }

        let rest = ScriptedRest::new(vec![
            ScriptedRest::ok(401, json!({})),
            ScriptedRest::ok(201, json!({"id": "urn:li:share:9"})),
        ]);
        let source = Arc::new(CountingSource {
            refreshes: AtomicUsize::new(0),
        });
        let mut fields = HashMap::new();
        fields.insert("author_urn".to_string(), "urn:li:person:abc".to_string());
        let ctx = AdapterContext::new(fields, source.clone());
        let adapter = LinkedInAdapter::new(ctx, rest.clone());

        let outcome = adapter
            .publish(&ContentPayload::new("", "post"))
            .await
            .unwrap();
        assert_eq!(outcome.external_id(), Some("urn:li:share:9"));
        assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);

        let requests = rest.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].bearer.as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_twitter_truncates_to_280_chars() {
        let rest = ScriptedRest::new(vec![ScriptedRest::ok(201, json!({"data": {"id": "t1"}}))]);
        let adapter = TwitterAdapter::new(social_ctx(&[]), rest.clone());
        let long_body = "x".repeat(400);
        adapter
            .publish(&ContentPayload::new("", long_body))
            .await
            .unwrap();

        let requests = rest.requests.lock().unwrap();
        let text = requests[0].body.as_ref().unwrap()["text"].as_str().unwrap();
        assert_eq!(text.chars().count(), TWEET_MAX_CHARS);
    }

    #[tokio::test]
    async fn test_facebook_schedule_sets_publish_time() {
        let rest = ScriptedRest::new(vec![ScriptedRest::ok(200, json!({"id": "p_9"}))]);
        let adapter = FacebookAdapter::new(social_ctx(&[("page_id", "p-1")]), rest.clone());
        let when = Utc::now() + chrono::Duration::hours(6);

        adapter
            .schedule(&ContentPayload::new("", "later"), when)
            .await
            .unwrap();
        let requests = rest.requests.lock().unwrap();
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["published"], false);
        assert_eq!(body["scheduled_publish_time"], when.timestamp());
    }

    #[tokio::test]
    async fn test_instagram_two_step_publish() {
        let rest = ScriptedRest::new(vec![
            ScriptedRest::ok(200, json!({"id": "container-1"})),
            ScriptedRest::ok(200, json!({"id": "media-1"})),
        ]);
        let adapter = InstagramAdapter::new(social_ctx(&[("ig_user_id", "ig-1")]), rest.clone());
        let mut content = ContentPayload::new("", "caption");
        content.media_urls.push("https://cdn.example/pic.jpg".into());

        let outcome = adapter.publish(&content).await.unwrap();
        assert_eq!(outcome.external_id(), Some("media-1"));

        let requests = rest.requests.lock().unwrap();
        assert!(requests[0].url.ends_with("/ig-1/media"));
        assert!(requests[1].url.ends_with("/ig-1/media_publish"));
        assert_eq!(
            requests[1].body.as_ref().unwrap()["creation_id"],
            "container-1"
        );
    }

    #[tokio::test]
    async fn test_instagram_requires_media_url() {
        let rest = ScriptedRest::new(vec![]);
        let adapter = InstagramAdapter::new(social_ctx(&[("ig_user_id", "ig-1")]), rest);
        let result = adapter.publish(&ContentPayload::new("", "caption")).await;
        assert!(matches!(
            result,
            Err(AdapterError::InvalidCredentials { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_degraded_on_rate_limit() {
        let rest = ScriptedRest::new(vec![ScriptedRest::ok(429, json!({}))]);
        let adapter = TwitterAdapter::new(social_ctx(&[]), rest);
        let check = adapter.check_health().await;
        assert_eq!(check.status, HealthStatus::Degraded);
    }
}
