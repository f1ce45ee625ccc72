//! Content creation & testing agent.
//!
//! Generation produces N variations per request: each takes an approach
//! from the project-type's rotation, builds a prompt from the brief, the
//! brand guidelines, and the approach, and asks the text generator. A
//! generator failure or an unparseable response falls back to a
//! deterministic templated variation, so the N-variations contract always
//! holds. Testing splits the stored variations evenly across segments,
//! completes after the configured duration, scores composites (60%
//! engagement, 40% conversion), and broadcasts the winner.

use crate::AgentDeps;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use marketeer_core::cache::Cache;
use marketeer_core::error::{AgentError, TaskError};
use marketeer_core::runtime::{Agent, AgentConfig, BaseAgent, TaskContext, TaskOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Composite score weights.
const ENGAGEMENT_WEIGHT: f64 = 0.6;
const CONVERSION_WEIGHT: f64 = 0.4;

/// Variation approaches per project type, rotated by variation index.
pub fn variation_approaches(project_type: &str) -> &'static [&'static str] {
    match project_type {
        "Blog" => &[
            "comprehensive guide",
            "case study focused",
            "how-to tutorial",
            "listicle format",
            "thought leadership",
        ],
        "Social Post" => &[
            "question-based",
            "statistic highlight",
            "tip or hack",
            "quote format",
            "before and after",
        ],
        "Email" => &[
            "problem-solution",
            "news announcement",
            "educational series",
            "case study spotlight",
            "exclusive offer",
        ],
        "Landing Page" => &[
            "problem-agitate-solve",
            "benefits-focused",
            "social proof centered",
            "urgency and scarcity",
            "step-by-step process",
        ],
        _ => &[
            "educational",
            "promotional",
            "storytelling",
            "data-driven",
            "expert interview",
        ],
    }
}

// ---------------------------------------------------------------------------
// Text generation seam
// ---------------------------------------------------------------------------

/// Opaque text generator: prompt in, text out.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate_text(&self, prompt: &str) -> Result<String, String>;
}

/// Chat-completions-backed generator keyed by `OPENAI_API_KEY`.
pub struct OpenAiTextGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiTextGenerator {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").ok()?;
        if api_key.is_empty() {
            return None;
        }
        Some(Self {
            client: reqwest::Client::new(),
            api_key,
            model: "gpt-4o-mini".to_string(),
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn generate_text(&self, prompt: &str) -> Result<String, String> {
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.7,
        });
        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .timeout(StdDuration::from_secs(30))
            .json(&body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        let parsed: Value = response.json().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("generator returned {status}"));
        }
        parsed
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| "generator response missing content".to_string())
    }
}

/// Generator that always fails; selected when no API key is configured, so
/// every variation takes the template path.
pub struct UnavailableGenerator;

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    async fn generate_text(&self, _prompt: &str) -> Result<String, String> {
        Err("no text generator configured".into())
    }
}

fn build_prompt(
    topic: &str,
    project_type: &str,
    approach: &str,
    brief: &Value,
    guidelines: &Value,
) -> String {
    let objective = brief
        .get("objective")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| format!("Educate the audience about {topic}"));
    let voice = guidelines
        .get("voice")
        .and_then(|v| v.as_str())
        .unwrap_or("Professional and friendly");
    format!(
        "Write a {project_type} about \"{topic}\" using a {approach} approach.\n\
         Objective: {objective}\n\
         Brand voice: {voice}\n\
         Respond as JSON with \"title\" and \"body\" fields."
    )
}

/// Deterministic fallback when the generator is unavailable or the
/// response cannot be parsed.
fn template_variation(topic: &str, project_type: &str, approach: &str, index: usize) -> Value {
    let title = match project_type {
        "Blog" => format!("The Complete Guide to {topic}"),
        "Social Post" => format!("Did you know? {topic} tip of the day"),
        "Email" => format!("{topic} Insights: Your Weekly Update"),
        "Landing Page" => format!("{topic} Solutions for Your Business"),
        other => format!("{topic} Content for {other}"),
    };
    let body = format!(
        "{topic} matters more than ever. This {} takes a {approach} angle: \
         start with why {topic} is worth your team's attention, walk through \
         the practical steps, and close with what to measure. \
         (Variation {})",
        project_type.to_lowercase(),
        index + 1,
    );
    json!({"title": title, "body": body})
}

fn parse_generated(text: &str) -> Option<(String, String)> {
    let parsed: Value = serde_json::from_str(text.trim()).ok()?;
    let title = parsed.get("title")?.as_str()?.to_string();
    let body = parsed.get("body")?.as_str()?.to_string();
    Some((title, body))
}

// ---------------------------------------------------------------------------
// Telemetry seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariationMetrics {
    pub impressions: u64,
    pub engagement_rate: f64,
    pub conversion_rate: f64,
}

impl VariationMetrics {
    pub fn composite_score(&self) -> f64 {
        ENGAGEMENT_WEIGHT * self.engagement_rate + CONVERSION_WEIGHT * self.conversion_rate
    }
}

/// Source of per-variation performance data. The default fabricates
/// deterministic metrics; deployments with real telemetry register their
/// own implementation.
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    async fn metrics_for(&self, test_id: &str, variation_id: &str) -> VariationMetrics;
}

/// Deterministic fabricated metrics derived from the variation id.
pub struct FabricatedTelemetry;

#[async_trait]
impl TelemetrySource for FabricatedTelemetry {
    async fn metrics_for(&self, _test_id: &str, variation_id: &str) -> VariationMetrics {
        // Stable pseudo-randomness: the same variation always scores the
        // same, which keeps reruns comparable.
        let seed: u64 = variation_id
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
                (acc ^ b as u64).wrapping_mul(0x100_0000_01b3)
            });
        let engagement = 0.5 + (seed % 750) as f64 / 100.0;
        let conversion = 0.1 + ((seed >> 16) % 490) as f64 / 100.0;
        VariationMetrics {
            impressions: 1000 + seed % 9000,
            engagement_rate: engagement,
            conversion_rate: conversion,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

struct CreationState {
    base: BaseAgent,
    cache: Arc<dyn Cache>,
    generator: Arc<dyn TextGenerator>,
    telemetry: Arc<dyn TelemetrySource>,
}

/// The content creation & testing agent.
pub struct ContentCreationAgent {
    base: BaseAgent,
    state: Arc<CreationState>,
}

impl ContentCreationAgent {
    pub const AGENT_ID: &'static str = "content_creation";

    pub fn new(deps: &AgentDeps) -> Self {
        let generator: Arc<dyn TextGenerator> = match OpenAiTextGenerator::from_env() {
            Some(generator) => Arc::new(generator),
            None => Arc::new(UnavailableGenerator),
        };
        Self::with_seams(deps, generator, Arc::new(FabricatedTelemetry))
    }

    pub fn with_seams(
        deps: &AgentDeps,
        generator: Arc<dyn TextGenerator>,
        telemetry: Arc<dyn TelemetrySource>,
    ) -> Self {
        let base = BaseAgent::new(
            AgentConfig::new(Self::AGENT_ID, "Content Creation & Testing Agent"),
            deps.broker.clone(),
        );
        let state = Arc::new(CreationState {
            base: base.clone(),
            cache: deps.cache.clone(),
            generator,
            telemetry,
        });

        let st = state.clone();
        base.register_task_handler("ai_content_generation", move |ctx| {
            let st = st.clone();
            async move { st.generate_content(ctx).await }
        });
        let st = state.clone();
        base.register_task_handler("content_testing", move |ctx| {
            let st = st.clone();
            async move { st.design_test(ctx).await }
        });

        Self { base, state }
    }

    pub fn base(&self) -> &BaseAgent {
        &self.base
    }

    /// Complete a running test immediately. The scheduled completion path
    /// calls this; tests call it directly instead of waiting out the clock.
    pub async fn complete_test_now(&self, project_id: &str) -> Result<Value, TaskError> {
        self.state.complete_test(project_id).await
    }
}

#[async_trait::async_trait]
impl Agent for ContentCreationAgent {
    fn agent_id(&self) -> &str {
        Self::AGENT_ID
    }

    fn name(&self) -> &str {
        "Content Creation & Testing Agent"
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

fn variations_key(project_id: &str) -> String {
    format!("content_variations:{project_id}")
}

fn test_key(project_id: &str) -> String {
    format!("content_test:{project_id}")
}

impl CreationState {
    async fn generate_content(&self, ctx: TaskContext) -> TaskOutcome {
        let project_id = ctx.require_str("project_id")?.to_string();
        let topic = ctx.require_str("content_topic")?.to_string();
        let project_type = ctx
            .optional_str("project_type")
            .unwrap_or("Blog")
            .to_string();
        let count = ctx
            .payload
            .get("variation_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(3)
            .clamp(1, 10) as usize;
        let brief = ctx.payload.get("content_brief").cloned().unwrap_or(json!({}));
        let guidelines = ctx
            .payload
            .get("brand_guidelines")
            .cloned()
            .unwrap_or(json!({}));

        let approaches = variation_approaches(&project_type);
        let mut variations = Vec::with_capacity(count);
        for index in 0..count {
            let approach = approaches[index % approaches.len()];
            let prompt = build_prompt(&topic, &project_type, approach, &brief, &guidelines);

            let (title, body, generated_by) = match self.generator.generate_text(&prompt).await {
                Ok(text) => match parse_generated(&text) {
                    Some((title, body)) => (title, body, "generator"),
                    None => {
                        debug!(index, "generated text unparseable, using template");
                        let fallback = template_variation(&topic, &project_type, approach, index);
                        (
                            fallback["title"].as_str().unwrap_or_default().to_string(),
                            fallback["body"].as_str().unwrap_or_default().to_string(),
                            "template",
                        )
                    }
                },
                Err(e) => {
                    debug!(index, error = %e, "generator unavailable, using template");
                    let fallback = template_variation(&topic, &project_type, approach, index);
                    (
                        fallback["title"].as_str().unwrap_or_default().to_string(),
                        fallback["body"].as_str().unwrap_or_default().to_string(),
                        "template",
                    )
                }
            };

            variations.push(json!({
                "variation_id": format!("var_{}", index + 1),
                "approach": approach,
                "title": title,
                "body": body,
                "generated_by": generated_by,
            }));
        }

        // Variations live in cache for the testing stage.
        self.cache
            .set(&variations_key(&project_id), json!(variations), None)
            .await;

        info!(
            project_id,
            topic,
            project_type,
            count = variations.len(),
            "content variations generated"
        );
        Ok(json!({
            "project_id": project_id,
            "content_topic": topic,
            "project_type": project_type,
            "variations": variations,
        }))
    }

    async fn design_test(&self, ctx: TaskContext) -> TaskOutcome {
        let project_id = ctx.require_str("project_id")?.to_string();
        let duration_days = ctx
            .payload
            .get("duration_days")
            .and_then(|v| v.as_f64())
            .unwrap_or(7.0);
        if duration_days <= 0.0 {
            return Err(TaskError::validation("duration_days must be positive"));
        }

        let variations = self
            .cache
            .get(&variations_key(&project_id))
            .await
            .and_then(|v| v.as_array().cloned())
            .ok_or_else(|| {
                TaskError::not_found(format!("no variations stored for project '{project_id}'"))
            })?;
        if variations.len() < 2 {
            return Err(TaskError::conflict(
                "a test needs at least two variations",
            ));
        }

        let segments = ctx
            .payload
            .get("audience_segments")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_else(|| vec![json!("all")]);
        let test_type = if variations.len() == 2 { "ab" } else { "multivariate" };
        let allocation = 100.0 / variations.len() as f64;

        let start = Utc::now();
        let end = start + Duration::seconds((duration_days * 86_400.0) as i64);
        let test_id = Uuid::new_v4().to_string();
        let test = json!({
            "test_id": test_id,
            "project_id": project_id,
            "test_type": test_type,
            "variations": variations,
            "audience_segments": segments,
            "allocation_percent": allocation,
            "status": "running",
            "start": start,
            "end": end,
        });
        self.cache.set(&test_key(&project_id), test.clone(), None).await;

        // Completion is timer-driven; nothing blocks on it.
        let state = self.clone_for_completion();
        let delay = StdDuration::from_secs_f64(duration_days * 86_400.0);
        let completion_project = project_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match state.complete_test(&completion_project).await {
                Ok(result) => debug!(
                    project_id = %completion_project,
                    winner = %result["winner"]["variation_id"],
                    "scheduled test completion"
                ),
                Err(e) => warn!(project_id = %completion_project, error = %e, "test completion failed"),
            }
        });

        info!(project_id, test_id = %test["test_id"], test_type, "content test designed");
        Ok(test)
    }

    fn clone_for_completion(&self) -> Arc<CreationState> {
        Arc::new(CreationState {
            base: self.base.clone(),
            cache: self.cache.clone(),
            generator: self.generator.clone(),
            telemetry: self.telemetry.clone(),
        })
    }

    async fn complete_test(&self, project_id: &str) -> Result<Value, TaskError> {
        let mut test = self
            .cache
            .get(&test_key(project_id))
            .await
            .ok_or_else(|| {
                TaskError::not_found(format!("no test stored for project '{project_id}'"))
            })?;
        if test["status"] == "completed" {
            return Ok(test);
        }
        let test_id = test["test_id"].as_str().unwrap_or_default().to_string();
        let variations = test["variations"].as_array().cloned().unwrap_or_default();

        let mut results = Vec::new();
        let mut winner: Option<(f64, Value)> = None;
        for variation in &variations {
            let variation_id = variation["variation_id"].as_str().unwrap_or_default();
            let metrics = self.telemetry.metrics_for(&test_id, variation_id).await;
            let score = metrics.composite_score();
            let row = json!({
                "variation_id": variation_id,
                "approach": variation["approach"],
                "metrics": metrics,
                "composite_score": score,
            });
            if winner.as_ref().is_none_or(|(best, _)| score > *best) {
                winner = Some((score, row.clone()));
            }
            results.push(row);
        }
        let winner = winner
            .map(|(_, row)| row)
            .ok_or_else(|| TaskError::internal("test has no variations"))?;

        test["status"] = json!("completed");
        test["results"] = json!(results);
        test["winner"] = winner.clone();
        test["completed_at"] = json!(Utc::now());
        self.cache.set(&test_key(project_id), test.clone(), None).await;

        if self.base.is_running() {
            if let Err(e) = self
                .base
                .broadcast_event(
                    "content_test_completed",
                    json!({
                        "test_id": test_id,
                        "project_id": project_id,
                        "winner": winner,
                        "results": results,
                    }),
                )
                .await
            {
                warn!(project_id, error = %e, "test completion broadcast failed");
            }
        }
        Ok(test)
    }
}
