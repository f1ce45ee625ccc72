//! Brand & project agent — onboarding, project lifecycle, logo uploads,
//! and webhook registration.
//!
//! Onboarding enriches from the brand's website when a URL is provided;
//! enrichment failures degrade to empty, never to a failed onboard.
//! Caller-provided guidelines always win over extracted signals.

use crate::AgentDeps;
use crate::enrich::{HttpSiteFetcher, SiteFetcher, enrich_from_website};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::Utc;
use marketeer_core::audit::AuditEntry;
use marketeer_core::error::{AgentError, TaskError};
use marketeer_core::runtime::{Agent, AgentConfig, BaseAgent, EventContext, TaskContext, TaskOutcome};
use marketeer_core::webhooks::{Webhook, WebhookDispatcher};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extensions accepted for brand logos.
const LOGO_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp"];

struct BrandProjectState {
    store: Arc<marketeer_core::Store>,
    webhooks: Arc<WebhookDispatcher>,
    fetcher: Arc<dyn SiteFetcher>,
    uploads_root: PathBuf,
    max_logo_bytes: u64,
}

/// The brand & project management agent.
pub struct BrandProjectAgent {
    base: BaseAgent,
}

impl BrandProjectAgent {
    pub const AGENT_ID: &'static str = "brand_project";

    pub fn new(deps: &AgentDeps, webhooks: Arc<WebhookDispatcher>) -> Self {
        Self::with_fetcher(deps, webhooks, Arc::new(HttpSiteFetcher::new()))
    }

    pub fn with_fetcher(
        deps: &AgentDeps,
        webhooks: Arc<WebhookDispatcher>,
        fetcher: Arc<dyn SiteFetcher>,
    ) -> Self {
        let base = BaseAgent::new(
            AgentConfig::new(Self::AGENT_ID, "Brand & Project Agent"),
            deps.broker.clone(),
        );
        let state = Arc::new(BrandProjectState {
            store: deps.store.clone(),
            webhooks,
            fetcher,
            uploads_root: deps.config.uploads.root.clone(),
            max_logo_bytes: deps.config.uploads.max_logo_bytes,
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
        task!("onboard_brand", onboard_brand);
        task!("update_brand", update_brand);
        task!("get_brand_info", get_brand_info);
        task!("create_project", create_project);
        task!("update_project", update_project);
        task!("get_project_info", get_project_info);
        task!("assign_project", assign_project);
        task!("get_brand_projects", get_brand_projects);
        task!("get_project_types", get_project_types);
        task!("create_project_type", create_project_type);
        task!("upload_brand_logo", upload_brand_logo);
        task!("delete_brand_logo", delete_brand_logo);
        task!("health_check", health_check);
        task!("register_webhook", register_webhook);
        task!("unregister_webhook", unregister_webhook);

        let st = state.clone();
        base.register_event_handler("user_created", move |ctx| {
            let st = st.clone();
            async move { st.on_user_created(ctx).await }
        });
        let st = state.clone();
        base.register_event_handler("content.published", move |ctx| {
            let st = st.clone();
            async move { st.on_content_published(ctx).await }
        });

        Self { base }
    }

    pub fn base(&self) -> &BaseAgent {
        &self.base
    }
}

#[async_trait::async_trait]
impl Agent for BrandProjectAgent {
    fn agent_id(&self) -> &str {
        Self::AGENT_ID
    }

    fn name(&self) -> &str {
        "Brand & Project Agent"
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

impl BrandProjectState {
    fn audit(&self, user: &str, action: &str, resource_type: &str, resource_id: &str) {
        let entry = AuditEntry::new(user, action, resource_type, resource_id)
            .with_agent(BrandProjectAgent::AGENT_ID);
        if let Err(e) = self.store.insert_audit(&entry) {
            debug!(error = %e, "audit insert failed");
        }
    }

    // -- brands -------------------------------------------------------------

    async fn onboard_brand(&self, ctx: TaskContext) -> TaskOutcome {
        let company_name = ctx.require_str("company_name")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let website_url = ctx.optional_str("website_url").map(String::from);

        let enrichment = match &website_url {
            Some(url) => enrich_from_website(&*self.fetcher, url).await,
            None => Default::default(),
        };

        let caller_guidelines = ctx
            .payload
            .get("brand_guidelines")
            .cloned()
            .unwrap_or_else(|| json!({}));

        // Extracted signals seed the guidelines; the caller wins on conflict.
        let mut guidelines = json!({
            "colors": enrichment.colors,
            "fonts": enrichment.fonts,
        });
        if let (Some(target), Some(source)) =
            (guidelines.as_object_mut(), caller_guidelines.as_object())
        {
            for (key, value) in source {
                target.insert(key.clone(), value.clone());
            }
        }

        let description = ctx
            .optional_str("description")
            .map(String::from)
            .or(enrichment.description);

        let brand_id = Uuid::new_v4().to_string();
        info!(brand_id, company = %company_name, "brand onboarded");
        let brand = json!({
            "brand_id": brand_id,
            "company_name": company_name,
            "website_url": website_url,
            "description": description,
            "site_title": enrichment.title,
            "logo_url": enrichment.logo_url,
            "brand_guidelines": guidelines,
            "created_by": user_id,
            "created_at": Utc::now(),
        });
        self.store.upsert_brand(&brand_id, &brand)?;
        self.audit(&user_id, "brand_onboarded", "brand", &brand_id);
        Ok(brand)
    }

    async fn update_brand(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?;
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let mut brand = self
            .store
            .get_brand(brand_id)?
            .ok_or_else(|| TaskError::not_found(format!("brand '{brand_id}' not found")))?;
        let previous = brand.clone();

        if let (Some(target), Some(updates)) = (brand.as_object_mut(), ctx.payload.as_object()) {
            for (key, value) in updates {
                if key == "brand_id" || key == "user_id" {
                    continue;
                }
                target.insert(key.clone(), value.clone());
            }
        }
        self.store.upsert_brand(brand_id, &brand)?;
        let entry = AuditEntry::new(&user_id, "brand_updated", "brand", brand_id)
            .with_states(Some(previous), Some(brand.clone()))
            .with_agent(BrandProjectAgent::AGENT_ID);
        if let Err(e) = self.store.insert_audit(&entry) {
            debug!(error = %e, "audit insert failed");
        }
        Ok(brand)
    }

    async fn get_brand_info(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?;
        self.store
            .get_brand(brand_id)?
            .ok_or_else(|| TaskError::not_found(format!("brand '{brand_id}' not found")))
    }

    // -- projects -----------------------------------------------------------

    async fn create_project(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let name = ctx.require_str("name")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        if self.store.get_brand(&brand_id)?.is_none() {
            return Err(TaskError::not_found(format!("brand '{brand_id}' not found")));
        }

        let project_id = Uuid::new_v4().to_string();
        let project = json!({
            "project_id": project_id,
            "brand_id": brand_id,
            "name": name,
            "project_type": ctx.optional_str("project_type"),
            "status": "draft",
            "assigned_to": Value::Null,
            "created_by": user_id,
            "created_at": Utc::now(),
        });
        self.store.upsert_project(&project_id, &brand_id, &project)?;
        self.audit(&user_id, "project_created", "project", &project_id);
        Ok(project)
    }

    async fn update_project(&self, ctx: TaskContext) -> TaskOutcome {
        let project_id = ctx.require_str("project_id")?;
        let user_id = ctx.optional_str("user_id").unwrap_or("system");
        let mut project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| TaskError::not_found(format!("project '{project_id}' not found")))?;

        let current_status = project
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("draft")
            .to_string();
        if let Some(next_status) = ctx.optional_str("status")
            && next_status == "published"
            && current_status == "draft"
        {
            return Err(TaskError::conflict(
                "draft content cannot move directly to published",
            ));
        }

        let brand_id = project
            .get("brand_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let (Some(target), Some(updates)) = (project.as_object_mut(), ctx.payload.as_object()) {
            for (key, value) in updates {
                if key == "project_id" || key == "brand_id" || key == "user_id" {
                    continue;
                }
                target.insert(key.clone(), value.clone());
            }
        }
        self.store.upsert_project(project_id, &brand_id, &project)?;
        self.audit(user_id, "project_updated", "project", project_id);
        Ok(project)
    }

    async fn get_project_info(&self, ctx: TaskContext) -> TaskOutcome {
        let project_id = ctx.require_str("project_id")?;
        self.store
            .get_project(project_id)?
            .ok_or_else(|| TaskError::not_found(format!("project '{project_id}' not found")))
    }

    async fn assign_project(&self, ctx: TaskContext) -> TaskOutcome {
        let project_id = ctx.require_str("project_id")?;
        let assignee = ctx.require_str("assignee_id")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system");
        let mut project = self
            .store
            .get_project(project_id)?
            .ok_or_else(|| TaskError::not_found(format!("project '{project_id}' not found")))?;
        let brand_id = project
            .get("brand_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        project["assigned_to"] = json!(assignee);
        self.store.upsert_project(project_id, &brand_id, &project)?;
        self.audit(user_id, "project_assigned", "project", project_id);
        Ok(project)
    }

    async fn get_brand_projects(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?;
        let projects = self.store.projects_for_brand(brand_id)?;
        Ok(json!({"brand_id": brand_id, "projects": projects}))
    }

    async fn get_project_types(&self, _ctx: TaskContext) -> TaskOutcome {
        let types: Vec<Value> = self
            .store
            .project_types()?
            .into_iter()
            .map(|(name, description)| json!({"name": name, "description": description}))
            .collect();
        Ok(json!({"project_types": types}))
    }

    async fn create_project_type(&self, ctx: TaskContext) -> TaskOutcome {
        let name = ctx.require_str("name")?;
        let description = ctx.optional_str("description").unwrap_or_default();
        self.store.create_project_type(name, description)?;
        Ok(json!({"name": name, "description": description}))
    }

    // -- logos --------------------------------------------------------------

    async fn upload_brand_logo(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let filename = ctx.require_str("filename")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let encoded = ctx.require_str("content_base64")?;

        if filename.contains('/') || filename.contains("..") {
            return Err(TaskError::validation("filename must be a bare name"));
        }
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        if !LOGO_EXTENSIONS.contains(&extension.as_str()) {
            return Err(TaskError::validation(format!(
                "extension '{extension}' not allowed (expected one of {LOGO_EXTENSIONS:?})"
            )));
        }

        let bytes = B64
            .decode(encoded)
            .map_err(|e| TaskError::validation(format!("content_base64 is not base64: {e}")))?;
        if bytes.len() as u64 > self.max_logo_bytes {
            return Err(TaskError::validation(format!(
                "logo exceeds {} bytes",
                self.max_logo_bytes
            )));
        }

        let mut brand = self
            .store
            .get_brand(&brand_id)?
            .ok_or_else(|| TaskError::not_found(format!("brand '{brand_id}' not found")))?;
        let previous_path = brand
            .get("logo_path")
            .and_then(|v| v.as_str())
            .map(String::from);

        let dir = self.uploads_root.join("logos").join(&brand_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TaskError::internal(format!("cannot create upload dir: {e}")))?;
        let path = dir.join(&filename);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| TaskError::internal(format!("cannot write logo: {e}")))?;

        let public_path = format!("/uploads/logos/{brand_id}/{filename}");
        brand["logo_path"] = json!(path.to_string_lossy());
        brand["logo_url"] = json!(public_path);
        self.store.upsert_brand(&brand_id, &brand)?;

        // Only after the record points at the new file is the old one
        // removed.
        if let Some(old) = previous_path
            && old != path.to_string_lossy()
            && let Err(e) = tokio::fs::remove_file(&old).await
        {
            warn!(path = %old, error = %e, "stale logo removal failed");
        }

        self.audit(&user_id, "logo_uploaded", "brand", &brand_id);
        Ok(json!({"brand_id": brand_id, "logo_url": public_path, "size_bytes": bytes.len()}))
    }

    async fn delete_brand_logo(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?;
        let user_id = ctx.optional_str("user_id").unwrap_or("system");
        let mut brand = self
            .store
            .get_brand(brand_id)?
            .ok_or_else(|| TaskError::not_found(format!("brand '{brand_id}' not found")))?;

        let path = brand.get("logo_path").and_then(|v| v.as_str()).map(String::from);
        brand["logo_path"] = Value::Null;
        brand["logo_url"] = Value::Null;
        self.store.upsert_brand(brand_id, &brand)?;
        if let Some(path) = path
            && let Err(e) = tokio::fs::remove_file(&path).await
        {
            warn!(path = %path, error = %e, "logo file removal failed");
        }
        self.audit(user_id, "logo_deleted", "brand", brand_id);
        Ok(json!({"brand_id": brand_id, "deleted": true}))
    }

    async fn health_check(&self, _ctx: TaskContext) -> TaskOutcome {
        Ok(json!({
            "agent": BrandProjectAgent::AGENT_ID,
            "status": "healthy",
            "timestamp": Utc::now(),
        }))
    }

    // -- webhooks -----------------------------------------------------------

    async fn register_webhook(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let url = ctx.require_str("url")?.to_string();
        let user_id = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let events: Vec<String> = ctx
            .payload
            .get("events")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_else(|| vec!["*".to_string()]);

        let mut webhook = Webhook::new(&brand_id, &url, events, &user_id);
        if let Some(secret) = ctx.optional_str("secret") {
            webhook = webhook.with_secret(secret);
        }
        self.webhooks
            .register(&webhook)
            .map_err(|e| TaskError::validation(e.to_string()))?;
        self.audit(
            &user_id,
            "webhook_created",
            "webhook",
            &webhook.webhook_id.to_string(),
        );
        Ok(json!({
            "webhook_id": webhook.webhook_id,
            "brand_id": brand_id,
            "url": url,
            "events": webhook.events,
        }))
    }

    async fn unregister_webhook(&self, ctx: TaskContext) -> TaskOutcome {
        let raw = ctx.require_str("webhook_id")?;
        let user_id = ctx.optional_str("user_id").unwrap_or("system");
        let webhook_id: Uuid = raw
            .parse()
            .map_err(|_| TaskError::validation(format!("'{raw}' is not a webhook id")))?;
        self.webhooks
            .unregister(webhook_id)
            .map_err(|e| TaskError::not_found(e.to_string()))?;
        self.audit(user_id, "webhook_deleted", "webhook", raw);
        Ok(json!({"webhook_id": raw, "deleted": true}))
    }

    // -- events -------------------------------------------------------------

    async fn on_user_created(&self, ctx: EventContext) {
        let Some(brand_id) = ctx.payload.get("brand_id").and_then(|v| v.as_str()) else {
            return;
        };
        if let Err(e) = self
            .webhooks
            .trigger_event(brand_id, "user_created", &ctx.payload)
        {
            warn!(brand_id, error = %e, "user_created webhook dispatch failed");
        }
    }

    async fn on_content_published(&self, ctx: EventContext) {
        if let Some(project_id) = ctx.payload.get("project_id").and_then(|v| v.as_str()) {
            match self.store.get_project(project_id) {
                Ok(Some(mut project)) => {
                    let already = project.get("status").and_then(|v| v.as_str())
                        == Some("published");
                    if !already {
                        let brand_id = project
                            .get("brand_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        project["status"] = json!("published");
                        if let Err(e) = self.store.upsert_project(project_id, &brand_id, &project)
                        {
                            warn!(project_id, error = %e, "project state advance failed");
                        }
                    }
                }
                Ok(None) => debug!(project_id, "published content for unknown project"),
                Err(e) => warn!(project_id, error = %e, "project lookup failed"),
            }
        }

        if let Some(brand_id) = ctx.payload.get("brand_id").and_then(|v| v.as_str())
            && let Err(e) = self
                .webhooks
                .trigger_event(brand_id, "content.published", &ctx.payload)
        {
            warn!(brand_id, error = %e, "content.published webhook dispatch failed");
        }
    }
}
