//! Advertising adapters — Facebook Ads and Google Ads.
//!
//! For the advertising category the content verbs map onto campaign
//! management: `publish` creates a campaign from the payload metadata,
//! `update` mutates it (including status flips for pause/resume/stop),
//! `fetch` returns the campaign with its performance fields, `delete`
//! removes it. Scheduling is expressed through campaign start/end dates,
//! not a separate verb.

use crate::adapter::{
    AdapterContext, AdapterError, AdapterOutcome, AdapterResult, ContentPayload,
    IntegrationAdapter, with_auth_retry,
};
use crate::health::{HealthCheck, probe};
use crate::http::{HttpMethod, RestClient, RestRequest, ensure_success};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use marketeer_core::integration::PlatformCategory;
use serde_json::json;
use std::sync::Arc;

const GRAPH_BASE: &str = "https://graph.facebook.com/v18.0";
const GOOGLE_ADS_BASE: &str = "https://googleads.googleapis.com/v16";

// ---------------------------------------------------------------------------
// Facebook Ads
// ---------------------------------------------------------------------------

pub struct FacebookAdsAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl FacebookAdsAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }

    async fn post(&self, url: String, body: serde_json::Value) -> Result<crate::http::RestResponse, AdapterError> {
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "facebook_ads")
                .bearer(token)
                .json(body.clone());
            let rest = self.rest.clone();
            async move {
                ensure_success(rest.execute(PlatformCategory::Advertising, request).await?)
            }
        })
        .await
    }
}

#[async_trait]
impl IntegrationAdapter for FacebookAdsAdapter {
    fn platform(&self) -> &'static str {
        "facebook_ads"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Advertising
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let account = self.ctx.require("account_id")?.to_string();
        let meta = &content.metadata;
        let body = json!({
            "name": content.title,
            "objective": meta.get("objective").and_then(|v| v.as_str()).unwrap_or("OUTCOME_TRAFFIC"),
            "status": meta.get("status").and_then(|v| v.as_str()).unwrap_or("PAUSED"),
            "daily_budget": meta.get("daily_budget_cents"),
            "special_ad_categories": [],
        });
        let response = self
            .post(format!("{GRAPH_BASE}/act_{account}/campaigns"), body)
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

    async fn update(&self, external_id: &str, content: &ContentPayload) -> AdapterResult {
        let mut body = serde_json::Map::new();
        if !content.title.is_empty() {
            body.insert("name".into(), json!(content.title));
        }
        if let Some(extra) = content.metadata.as_object() {
            for (key, value) in extra {
                body.insert(key.clone(), value.clone());
            }
        }
        let response = self
            .post(format!("{GRAPH_BASE}/{external_id}"), json!(body))
            .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let url = format!(
            "{GRAPH_BASE}/{external_id}?fields=name,status,objective,daily_budget,insights{{impressions,clicks,spend}}"
        );
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request =
                RestRequest::new(HttpMethod::Get, url.as_str(), "facebook_ads").bearer(token);
            let rest = self.rest.clone();
            async move {
                ensure_success(rest.execute(PlatformCategory::Advertising, request).await?)
            }
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
            let request =
                RestRequest::new(HttpMethod::Delete, url.as_str(), "facebook_ads").bearer(token);
            let rest = self.rest.clone();
            async move {
                ensure_success(rest.execute(PlatformCategory::Advertising, request).await?)
            }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let account = match self.ctx.require("account_id") {
            Ok(id) => id.to_string(),
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request = RestRequest::new(
            HttpMethod::Get,
            format!("{GRAPH_BASE}/act_{account}?fields=account_status"),
            "facebook_ads",
        )
        .bearer(token);
        probe(&*self.rest, PlatformCategory::Advertising, request).await
    }
}

// ---------------------------------------------------------------------------
// Google Ads
// ---------------------------------------------------------------------------

pub struct GoogleAdsAdapter {
    ctx: AdapterContext,
    rest: Arc<dyn RestClient>,
}

impl GoogleAdsAdapter {
    pub fn new(ctx: AdapterContext, rest: Arc<dyn RestClient>) -> Self {
        Self { ctx, rest }
    }

    async fn mutate(&self, operation: serde_json::Value) -> Result<crate::http::RestResponse, AdapterError> {
        let customer = self.ctx.require("customer_id")?.to_string();
        let developer_token = self.ctx.require("developer_token")?.to_string();
        let url = format!("{GOOGLE_ADS_BASE}/customers/{customer}/campaigns:mutate");
        let body = json!({"operations": [operation]});
        with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "google_ads")
                .bearer(token)
                .header("developer-token", developer_token.clone())
                .json(body.clone());
            let rest = self.rest.clone();
            async move {
                ensure_success(rest.execute(PlatformCategory::Advertising, request).await?)
            }
        })
        .await
    }
}

#[async_trait]
impl IntegrationAdapter for GoogleAdsAdapter {
    fn platform(&self) -> &'static str {
        "google_ads"
    }

    fn category(&self) -> PlatformCategory {
        PlatformCategory::Advertising
    }

    async fn publish(&self, content: &ContentPayload) -> AdapterResult {
        let meta = &content.metadata;
        let operation = json!({
            "create": {
                "name": content.title,
                "status": meta.get("status").and_then(|v| v.as_str()).unwrap_or("PAUSED"),
                "advertisingChannelType": meta.get("channel").and_then(|v| v.as_str()).unwrap_or("SEARCH"),
                "campaignBudget": meta.get("budget_resource"),
            }
        });
        let response = self.mutate(operation).await?;
        Ok(AdapterOutcome::success(
            response.str_field("/results/0/resourceName"),
            None,
            response.body,
        ))
    }

    async fn schedule(&self, _content: &ContentPayload, _when: DateTime<Utc>) -> AdapterResult {
        Ok(AdapterOutcome::unsupported("schedule"))
    }

    async fn update(&self, external_id: &str, content: &ContentPayload) -> AdapterResult {
        let mut update = serde_json::Map::new();
        update.insert("resourceName".into(), json!(external_id));
        if !content.title.is_empty() {
            update.insert("name".into(), json!(content.title));
        }
        if let Some(extra) = content.metadata.as_object() {
            for (key, value) in extra {
                update.insert(key.clone(), value.clone());
            }
        }
        let paths: Vec<String> = update.keys().filter(|k| *k != "resourceName").cloned().collect();
        let operation = json!({
            "update": update,
            "updateMask": paths.join(","),
        });
        let response = self.mutate(operation).await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn fetch(&self, external_id: &str) -> AdapterResult {
        let customer = self.ctx.require("customer_id")?.to_string();
        let developer_token = self.ctx.require("developer_token")?.to_string();
        let url = format!("{GOOGLE_ADS_BASE}/customers/{customer}/googleAds:search");
        let query = format!(
            "SELECT campaign.id, campaign.name, campaign.status, metrics.impressions, \
             metrics.clicks, metrics.cost_micros FROM campaign \
             WHERE campaign.resource_name = '{external_id}'"
        );
        let body = json!({"query": query});
        let response = with_auth_retry(&*self.ctx.tokens, |token| {
            let request = RestRequest::new(HttpMethod::Post, url.as_str(), "google_ads")
                .bearer(token)
                .header("developer-token", developer_token.clone())
                .json(body.clone());
            let rest = self.rest.clone();
            async move {
                ensure_success(rest.execute(PlatformCategory::Advertising, request).await?)
            }
        })
        .await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            response.body,
        ))
    }

    async fn delete(&self, external_id: &str) -> AdapterResult {
        let operation = json!({"remove": external_id});
        self.mutate(operation).await?;
        Ok(AdapterOutcome::success(
            Some(external_id.to_string()),
            None,
            json!({"deleted": true}),
        ))
    }

    async fn check_health(&self) -> HealthCheck {
        let customer = match self.ctx.require("customer_id") {
            Ok(id) => id.to_string(),
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let developer_token = match self.ctx.require("developer_token") {
            Ok(t) => t.to_string(),
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let token = match self.ctx.tokens.access_token().await {
            Ok(token) => token,
            Err(e) => return HealthCheck::from_transport_error(e.to_string(), 0),
        };
        let request = RestRequest::new(
            HttpMethod::Get,
            format!("{GOOGLE_ADS_BASE}/customers/{customer}"),
            "google_ads",
        )
        .bearer(token)
        .header("developer-token", developer_token);
        probe(&*self.rest, PlatformCategory::Advertising, request).await
    }
}
