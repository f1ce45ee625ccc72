//! End-to-end agent collaboration over the in-process broker.
//!
//! A client agent plays the role of the API edge: it sends tasks over the
//! `tasks` exchange and awaits correlated responses, exactly as production
//! callers do.

use async_trait::async_trait;
use marketeer_agents::content_creation::{FabricatedTelemetry, TextGenerator};
use marketeer_agents::enrich::SiteFetcher;
use marketeer_agents::{
    AgentDeps, AuthIntegrationAgent, BrandProjectAgent, ContentAdAgent, ContentCreationAgent,
    ContentStrategyAgent,
};
use marketeer_core::auth::{OAuthClient, OAuthProviderConfig, TokenEndpoint};
use marketeer_core::broker::{BackoffPolicy, Broker, MemoryBroker};
use marketeer_core::cache::MemoryCache;
use marketeer_core::config::AppConfig;
use marketeer_core::error::AgentError;
use marketeer_core::integration::{IntegrationRecord, PlatformCategory};
use marketeer_core::runtime::{Agent, AgentConfig, BaseAgent};
use marketeer_core::store::Store;
use marketeer_core::vault::CredentialVault;
use marketeer_core::webhooks::{WebhookDispatcher, WebhookTransport};
use marketeer_integrations::{AdapterError, RestClient, RestRequest, RestResponse};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct NullTransport;

#[async_trait]
impl WebhookTransport for NullTransport {
    async fn post(
        &self,
        _url: &str,
        _headers: &[(String, String)],
        _body: &str,
        _timeout: Duration,
    ) -> Result<u16, String> {
        Ok(200)
    }
}

struct AcmeFetcher;

#[async_trait]
impl SiteFetcher for AcmeFetcher {
    async fn fetch_html(&self, _url: &str) -> Result<String, String> {
        Ok(concat!(
            "<title>Acme</title>",
            r#"<meta name="description" content="Rocket-powered marketing.">"#,
            r#"<style>h1 { color: #c8102e; font-family: Inter, sans-serif; }</style>"#,
        )
        .to_string())
    }
}

struct TemplateOnlyGenerator;

#[async_trait]
impl TextGenerator for TemplateOnlyGenerator {
    async fn generate_text(&self, _prompt: &str) -> Result<String, String> {
        Err("no generator in tests".into())
    }
}

/// Scripted REST client routed by URL fragment.
struct RoutedRest {
    routes: Mutex<Vec<(String, Vec<RestResponse>)>>,
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
        let mut routes = self.routes.lock().unwrap();
        for (fragment, responses) in routes.iter_mut() {
            if request.url.contains(fragment.as_str()) && !responses.is_empty() {
                return Ok(responses.remove(0));
            }
        }
        Ok(RestResponse {
            status: 200,
            body: json!({"id": "default"}),
        })
    }
}

/// Token endpoint whose every exchange fails, so refresh attempts resolve
/// quickly instead of hanging the publish path.
struct DeadTokenEndpoint;

#[async_trait]
impl TokenEndpoint for DeadTokenEndpoint {
    async fn post_form(
        &self,
        _token_uri: &str,
        _form: &[(String, String)],
    ) -> Result<Value, String> {
        Err("invalid_grant".into())
    }

    async fn get_user_info(
        &self,
        _user_info_uri: &str,
        _access_token: &str,
    ) -> Result<Value, String> {
        Err("unauthorized".into())
    }
}

fn failing_oauth() -> OAuthClient {
    let mut providers = HashMap::new();
    providers.insert(
        "linkedin".to_string(),
        OAuthProviderConfig {
            provider: "linkedin".into(),
            auth_uri: "https://linkedin.example/auth".into(),
            token_uri: "https://linkedin.example/token".into(),
            user_info_uri: "https://linkedin.example/me".into(),
            client_id: "cid".into(),
            client_secret: "cs".into(),
            scopes: vec!["w_member_social".into()],
        },
    );
    OAuthClient::new(providers, Arc::new(DeadTokenEndpoint))
}

fn deps() -> AgentDeps {
    AgentDeps {
        broker: Arc::new(MemoryBroker::with_backoff(BackoffPolicy::immediate(3))),
        cache: Arc::new(MemoryCache::new()),
        store: Arc::new(Store::open_in_memory().unwrap()),
        vault: Arc::new(
            CredentialVault::new(b"workflow-test-vault-secret-01234".to_vec(), 1).unwrap(),
        ),
        config: Arc::new(AppConfig::default()),
    }
}

fn client_agent(deps: &AgentDeps) -> BaseAgent {
    BaseAgent::new(AgentConfig::new("api", "API Edge"), deps.broker.clone())
}

async fn call(client: &BaseAgent, target: &str, task: &str, payload: Value) -> Value {
    client
        .send_task(target, task, payload, Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .unwrap()
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

#[tokio::test]
async fn test_onboard_strategy_calendar_workflow() {
    let deps = deps();
    let webhooks = Arc::new(WebhookDispatcher::new(
        deps.store.clone(),
        Arc::new(NullTransport),
    ));

    let brand_agent =
        BrandProjectAgent::with_fetcher(&deps, webhooks.clone(), Arc::new(AcmeFetcher));
    let strategy_agent = ContentStrategyAgent::with_fetcher(&deps, Arc::new(AcmeFetcher));
    let client = client_agent(&deps);

    brand_agent.start().await.unwrap();
    strategy_agent.start().await.unwrap();
    client.start().await.unwrap();

    // 1. Onboard with website enrichment.
    let brand = call(
        &client,
        "brand_project",
        "onboard_brand",
        json!({
            "company_name": "Acme",
            "website_url": "https://acme.example",
        }),
    )
    .await;
    let brand_id = brand["brand_id"].as_str().unwrap().to_string();
    assert_eq!(brand["description"], "Rocket-powered marketing.");

    // 2. Strategy for the onboarded brand.
    let strategy = call(
        &client,
        "content_strategy",
        "content_strategy_development",
        json!({
            "brand_id": brand_id,
            "content_topics": ["AI", "SEO"],
            "project_types": ["Blog", "Social Post"],
        }),
    )
    .await;
    assert!(!strategy["strategic_themes"].as_array().unwrap().is_empty());
    let recommended: Vec<&str> = strategy["topic_recommendations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["topic"].as_str().unwrap())
        .collect();
    assert!(recommended.contains(&"AI"));
    assert!(recommended.contains(&"SEO"));

    // 3. Calendar across the quarter.
    let calendar = call(
        &client,
        "content_strategy",
        "content_calendar_creation",
        json!({
            "brand_id": brand_id,
            "content_topics": ["AI", "SEO"],
            "project_types": ["Blog", "Social Post"],
            "timeframe": {"start_date": "2025-04-01", "end_date": "2025-06-30"},
        }),
    )
    .await;
    let items = calendar["content_items"].as_array().unwrap();
    let blogs = items
        .iter()
        .filter(|i| i["project_type"] == "Blog")
        .count();
    let social = items
        .iter()
        .filter(|i| i["project_type"] == "Social Post")
        .count();
    assert!(blogs >= 12, "expected >= 12 blogs, got {blogs}");
    assert!(social >= 36, "expected >= 36 social posts, got {social}");
    assert!(
        items
            .iter()
            .all(|i| i["scheduled_date"].as_str().unwrap() <= "2025-06-30")
    );

    for agent in [&brand_agent as &dyn Agent, &strategy_agent as &dyn Agent] {
        agent.stop().await.unwrap();
    }
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_partial_publish_broadcasts_only_successes() {
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
        (
            "ugcPosts",
            vec![
                RoutedRest::response(401, json!({})),
                RoutedRest::response(401, json!({})),
            ],
        ),
    ]);
    let content_ad = ContentAdAgent::with_rest_client(&deps, rest.clone());
    let webhooks = Arc::new(WebhookDispatcher::new(
        deps.store.clone(),
        Arc::new(NullTransport),
    ));
    // The auth agent answers the inline refresh attempt; its exchange
    // fails, so the publish surfaces an auth error.
    let auth_agent = AuthIntegrationAgent::with_seams(&deps, webhooks, rest, failing_oauth());
    let client = client_agent(&deps);

    // A listener agent records the broadcast.
    let listener = BaseAgent::new(
        AgentConfig::new("listener", "Listener"),
        deps.broker.clone(),
    );
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = seen.clone();
    listener.register_event_handler("content.published", move |ctx| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(ctx.payload);
        }
    });

    content_ad.start().await.unwrap();
    auth_agent.start().await.unwrap();
    listener.start().await.unwrap();
    client.start().await.unwrap();

    let result = call(
        &client,
        "content_ad",
        "content_publishing",
        json!({
            "brand_id": "b-1",
            "platforms": ["wordpress", "linkedin"],
            "content": {"title": "Launch", "body": "We are live."},
        }),
    )
    .await;

    assert_eq!(result["status"], "partial");
    assert_eq!(result["platforms"]["wordpress"]["status"], "success");
    assert_eq!(result["platforms"]["linkedin"]["status"], "error");
    assert_eq!(result["platforms"]["linkedin"]["auth_error"], true);

    // The event lists only platforms that made it out.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let events = seen.lock().unwrap();
    assert_eq!(events.len(), 1);
    let platforms = events[0]["platforms"].as_array().unwrap();
    assert_eq!(platforms.len(), 1);
    assert_eq!(platforms[0], "wordpress");

    content_ad.stop().await.unwrap();
    auth_agent.stop().await.unwrap();
    listener.stop().await.unwrap();
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_generation_and_testing_workflow() {
    let deps = deps();
    let creation = ContentCreationAgent::with_seams(
        &deps,
        Arc::new(TemplateOnlyGenerator),
        Arc::new(FabricatedTelemetry),
    );
    let client = client_agent(&deps);

    creation.start().await.unwrap();
    client.start().await.unwrap();

    let generated = call(
        &client,
        "content_creation",
        "ai_content_generation",
        json!({
            "project_id": "p-1",
            "content_topic": "AI",
            "project_type": "Blog",
            "variation_count": 3,
        }),
    )
    .await;
    assert_eq!(generated["variations"].as_array().unwrap().len(), 3);

    let test = call(
        &client,
        "content_creation",
        "content_testing",
        json!({"project_id": "p-1", "duration_days": 30}),
    )
    .await;
    assert_eq!(test["status"], "running");
    assert_eq!(test["test_type"], "multivariate");

    // Completing ahead of the schedule still broadcasts the winner.
    let completed = creation.complete_test_now("p-1").await.unwrap();
    assert_eq!(completed["status"], "completed");
    assert!(completed["winner"]["variation_id"].as_str().is_some());

    creation.stop().await.unwrap();
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_stopped_agent_leaves_work_in_broker() {
    let deps = deps();
    let webhooks = Arc::new(WebhookDispatcher::new(
        deps.store.clone(),
        Arc::new(NullTransport),
    ));
    let brand_agent =
        BrandProjectAgent::with_fetcher(&deps, webhooks, Arc::new(AcmeFetcher));
    let client = client_agent(&deps);

    brand_agent.start().await.unwrap();
    client.start().await.unwrap();
    brand_agent.stop().await.unwrap();

    // Fire-and-forget to the stopped agent: the broker keeps the message.
    client
        .send_task("brand_project", "health_check", json!({}), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let depth = deps.broker.queue_depth("brand_project").await.unwrap();
    assert!(depth >= 1, "expected queued work, depth = {depth}");

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_caller_timeout_surfaces_as_timeout_error() {
    let deps = deps();
    let client = client_agent(&deps);
    let silent = BaseAgent::new(AgentConfig::new("silent", "Silent"), deps.broker.clone());
    silent.register_task_handler("slow", |_ctx| async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(json!({}))
    });
    silent.start().await.unwrap();
    client.start().await.unwrap();

    let result = client
        .send_task("silent", "slow", json!({}), Some(Duration::from_millis(80)))
        .await;
    assert!(matches!(result, Err(AgentError::ResponseTimeout { .. })));

    silent.stop().await.unwrap();
    client.stop().await.unwrap();
}
