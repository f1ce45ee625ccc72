//! CMS adapters — WordPress and Shopify.
//!
//! WordPress speaks the wp-json REST surface with a bearer token; Shopify
//! uses the admin API with its access-token header. Both support the full
//! verb set including scheduling.

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

// ---------------------------------------------------------------------------
// WordPress
// ---------------------------------------------------------------------------

pub struct WordPressAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl WordPressAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }

    fn base_url(&self) -> Result<String, crate::adapter::AdapterError> {
        Ok(self.ctx.require("site_url")?.trim_end_matches('/').to_string())
    }

    async fn post_article(
        &self,
        content: &ContentPayload,
        status: &str,
        date: Option<DateTime<Utc>>,
        external_id: Option<&str>,
    ) -> AdapterResult {
        let base = self.base_url()?;
        let url = match external_id {
            Some(id) => format!("{base}/wp-json/wp/v2/posts/{id}"),
            None => format!("{base}/wp-json/wp/v2/posts"),
        };
        let mut body = json!({
            "title": content.title,
            "content": content.body,
            "status": status,
        });
        if let Some(date) = date {
            body["date_gmt"] = json!(date.to_rfc3339());
        }
        if !content.tags.is_empty() {
            body["tags"] = json!(content.tags);
        }

        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "wordpress")
                .bearer(token)
                .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Cms, request).await?) }
        })
        .await?;

        Ok(AdapterOutcome::success(
            response.str_field("/id"),
            response.str_field("/link"),
            response.body,
        ))
    }
}

#[async_trait]
impl IntegrationAdapter for WordPressAdapter {
    fn platform(&self) -> &'static str {
        "wordpress"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Cms
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        self.post_article(content, "publish", None, None).await
    }

    async fn schedule(&self, content: &ContentPayload, when: DateTime<Utc>) -> AdapterResult {
        self.post_article(content, "future", Some(when), None).await
    }

    async fn update(&self, external_id: &str, content: &ContentPayload) -> AdapterResult {
        self.post_article(content, "publish", None, Some(external_id))
            .await
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let base = self.base_url()?;
        let url = format!("{base}/wp-json/wp/v2/posts/{external_id}");
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Get, url.as_str(), "wordpress").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Cms, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            response.str_field("/link"),
            response.body,
        ))
    }

    async fn delete(&self, external_id: &str) -> AdapterResult {
        let base = self.base_url()?;
        let url = format!("{base}/wp-json/wp/v2/posts/{external_id}?force=true");
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Delete, url.as_str(), "wordpress").bearer(token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Cms, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let Ok(base) = self.base_url() else {
            return HealthCheck::from_transport_error("missing site_url credential", 0);
        };
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request =
            RestRequest::new(HttpMethod::Get, format!("{base}/wp-json"), "wordpress").bearer(token);
        probe(&*self.rest, PlatformCategory::Cms, request).await
    }
}

// ---------------------------------------------------------------------------
// Shopify
// ---------------------------------------------------------------------------

const SHOPIFY_API_VERSION: &str = "2024-01";

pub struct ShopifyAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl ShopifyAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }

    fn admin_url(&self, path: &str) -> Result<String, crate::adapter::AdapterError> {
        let shop = self.ctx.require("shop_domain")?;
        Ok(format!(
            "https://{shop}/admin/api/{SHOPIFY_API_VERSION}/{path}"
        ))
    }

    fn blog_id(&self) -> String {
        self.ctx
            .fields
            .get("blog_id")
            .cloned()
            .unwrap_or_else(|| "1".to_string())
    }

    async fn write_article(
        &self,
        method: HttpMethod,
        path: String,
        content: &ContentPayload,
        published_at: Option<DateTime<Utc>>,
    ) -> AdapterResult {
        let url = self.admin_url(&path)?;
        let mut article = json!({
            "title": content.title,
            "body_html": content.body,
            "published": published_at.is_none(),
        });
        if let Some(at) = published_at {
            article["published_at"] = json!(at.to_rfc3339());
        }
        if !content.tags.is_empty() {
            article["tags"] = json!(content.tags.join(", "));
        }
        let body = json!({"article": article});

        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(method, url.as_str(), "shopify")
                .header("X-Shopify-Access-Token", token)
                .json(body.clone());
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Cms, request).await?) }
        })
        .await?;

        Ok(AdapterOutcome::success(
            response.str_field("/article/id"),
            None,
            response.body,
        ))
    }
}

#[async_trait]
impl IntegrationAdapter for ShopifyAdapter {
    fn platform(&self) -> &'static str {
        "shopify"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Cms
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let path = format!("blogs/{}/articles.json", self.blog_id());
        self.write_article(HttpMethod::Post, path, content, None).await
    }

    async fn schedule(&self, content: &ContentPayload, when: DateTime<Utc>) -> AdapterResult {
        let path = format!("blogs/{}/articles.json", self.blog_id());
        self.write_article(HttpMethod::Post, path, content, Some(when))
            .await
    }

    async fn update(&self, external_id: &str, content: &ContentPayload) -> AdapterResult {
        let path = format!("blogs/{}/articles/{external_id}.json", self.blog_id());
        self.write_article(HttpMethod::Put, path, content, None).await
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let path = format!("blogs/{}/articles/{external_id}.json", self.blog_id());
        let url = self.admin_url(&path)?;
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Get, url.as_str(), "shopify")
                .header("X-Shopify-Access-Token", token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Cms, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn delete(&self, external_id: &str) -> AdapterResult {
        let path = format!("blogs/{}/articles/{external_id}.json", self.blog_id());
        let url = self.admin_url(&path)?;
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Delete, url.as_str(), "shopify")
                .header("X-Shopify-Access-Token", token);
            let rest = self.rest.clone();
            async move { ensure_success(rest.execute(PlatformCategory::Cms, request).await?) }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let url = match self.admin_url("shop.json") {
            Ok(url) => url,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request = RestRequest::new(HttpMethod::Get, url, "shopify")
            .header("X-Shopify-Access-Token", token);
        probe(&*self.rest, PlatformCategory::Cms, request).await
    }
}
