//! Content strategy agent — strategy development, competitor analysis, and
//! calendar generation.
//!
//! Calendar generation distributes items week by week: each (topic,
//! project type) pair lands `frequency × weeks` items, topics rotate
//! fairly across weeks, and nothing schedules past the range end. Monthly
//! campaign themes and multi-part series ride on top of the item grid.

use crate::AgentDeps;
use crate::enrich::{HttpSiteFetcher, SiteFetcher, enrich_from_website};
use chrono::{Datelike, Duration, NaiveDate};
use marketeer_core::audit::AuditEntry;
use marketeer_core::error::{AgentError, TaskError};
use marketeer_core::runtime::{Agent, AgentConfig, BaseAgent, TaskContext, TaskOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Default weekly frequencies per project type, fractional allowed.
fn default_frequency(project_type: &str) -> f64 {
    match project_type {
        "Blog" => 1.0,
        "Social Post" => 3.0,
        "Email" => 1.0,
        "Landing Page" => 0.25,
        _ => 1.0,
    }
}

// ---------------------------------------------------------------------------
// Calendar engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarItem {
    pub id: String,
    pub title: String,
    pub project_type: String,
    pub content_topic: String,
    pub scheduled_date: NaiveDate,
    pub status: String,
    pub content_brief: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignTheme {
    pub id: String,
    pub name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub primary_topic: String,
    pub related_content_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesPart {
    pub content_id: String,
    pub part_number: u32,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSeries {
    pub id: String,
    pub name: String,
    pub description: String,
    pub project_type: String,
    pub content_topic: String,
    pub parts: Vec<SeriesPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarPlan {
    pub content_items: Vec<CalendarItem>,
    pub campaigns: Vec<CampaignTheme>,
    pub series: Vec<ContentSeries>,
    pub distribution: Value,
}

fn item_title(project_type: &str, topic: &str, date: NaiveDate) -> String {
    match project_type {
        "Blog" => format!("The Complete Guide to {topic} ({})", date.format("%B %Y")),
        "Social Post" => format!("Did you know? {topic} tip of the day"),
        "Email" => format!("{topic} Insights: Your Weekly Update"),
        "Landing Page" => format!("{topic} Solutions for Your Business"),
        other => format!("{topic} Content for {other}"),
    }
}

/// Build the full calendar plan for a date range.
pub fn generate_calendar(
    topics: &[String],
    project_types: &[String],
    frequencies: &HashMap<String, f64>,
    start: NaiveDate,
    end: NaiveDate,
) -> CalendarPlan {
    let mut items: Vec<CalendarItem> = Vec::new();

    // A zero-length range schedules nothing.
    if start < end {
        let total_days = (end - start).num_days();
        let total_weeks = (total_days / 7) as i64;

        for week in 0..=total_weeks {
            let week_start = start + Duration::weeks(week);
            if week_start > end {
                break;
            }
            for project_type in project_types {
                let frequency = frequencies
                    .get(project_type)
                    .copied()
                    .unwrap_or_else(|| default_frequency(project_type));
                let posts_this_week = if frequency >= 1.0 {
                    frequency as i64
                } else if frequency > 0.0 {
                    // Fractional cadence: one item every 1/frequency weeks.
                    let every = (1.0 / frequency) as i64;
                    if week % every.max(1) == 0 { 1 } else { 0 }
                } else {
                    0
                };

                for i in 0..posts_this_week {
                    let topic = if topics.is_empty() {
                        "General".to_string()
                    } else {
                        topics[((week + i) as usize) % topics.len()].clone()
                    };
                    let post_date = week_start + Duration::days(i.min(6));
                    if post_date > end {
                        continue;
                    }
                    items.push(CalendarItem {
                        id: format!("content_{}", items.len() + 1),
                        title: item_title(project_type, &topic, post_date),
                        project_type: project_type.clone(),
                        content_topic: topic.clone(),
                        scheduled_date: post_date,
                        status: "planned".to_string(),
                        content_brief: json!({
                            "objective": format!("Educate audience about {topic}"),
                            "key_points": [
                                format!("{topic} best practices"),
                                format!("{topic} implementation tips"),
                            ],
                            "target_audience": "Marketing professionals",
                            "call_to_action": "Contact for consultation",
                        }),
                    });
                }
            }
        }
    }

    let total_weeks = ((end - start).num_days() as f64) / 7.0;

    // Monthly campaign themes: one per topic, up to three, for ranges of at
    // least four weeks.
    let mut campaigns = Vec::new();
    if total_weeks >= 4.0 {
        for (i, topic) in topics.iter().take(3).enumerate() {
            let month_start = start + Duration::days((i as i64 % 3) * 30);
            let month_end = month_start + Duration::days(30);
            let related: Vec<String> = items
                .iter()
                .filter(|item| {
                    item.content_topic == *topic
                        && item.scheduled_date >= month_start
                        && item.scheduled_date <= month_end
                })
                .map(|item| item.id.clone())
                .collect();
            campaigns.push(CampaignTheme {
                id: format!("campaign_{}", i + 1),
                name: format!("{topic} Focus Month"),
                start_date: month_start,
                end_date: month_end,
                primary_topic: topic.clone(),
                related_content_ids: related,
            });
        }
    }

    // Multi-part series for long-form channels with enough material.
    let mut series = Vec::new();
    for topic in topics.iter().take(2) {
        for project_type in project_types {
            if project_type != "Blog" && project_type != "Email" {
                continue;
            }
            let related: Vec<&CalendarItem> = items
                .iter()
                .filter(|item| {
                    item.content_topic == *topic && item.project_type == *project_type
                })
                .collect();
            if related.len() >= 3 {
                let part_titles = [
                    format!("{topic} Fundamentals: Getting Started"),
                    format!("{topic} Advanced: Best Practices"),
                    format!("{topic} Mastery: Expert Techniques"),
                ];
                series.push(ContentSeries {
                    id: format!("series_{}", series.len() + 1),
                    name: format!("{topic} {project_type} Series"),
                    description: format!("A 3-part series covering key aspects of {topic}"),
                    project_type: project_type.clone(),
                    content_topic: topic.clone(),
                    parts: related
                        .iter()
                        .take(3)
                        .zip(part_titles)
                        .enumerate()
                        .map(|(n, (item, title))| SeriesPart {
                            content_id: item.id.clone(),
                            part_number: n as u32 + 1,
                            title,
                        })
                        .collect(),
                });
            }
        }
    }

    let mut by_type: HashMap<&str, usize> = HashMap::new();
    let mut by_topic: HashMap<&str, usize> = HashMap::new();
    let mut by_month: HashMap<String, usize> = HashMap::new();
    for item in &items {
        *by_type.entry(item.project_type.as_str()).or_default() += 1;
        *by_topic.entry(item.content_topic.as_str()).or_default() += 1;
        *by_month
            .entry(format!(
                "{}-{:02}",
                item.scheduled_date.year(),
                item.scheduled_date.month()
            ))
            .or_default() += 1;
    }
    let distribution = json!({
        "by_project_type": by_type,
        "by_topic": by_topic,
        "by_month": by_month,
    });

    CalendarPlan {
        content_items: items,
        campaigns,
        series,
        distribution,
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

struct StrategyState {
    store: Arc<marketeer_core::Store>,
    fetcher: Arc<dyn SiteFetcher>,
}

/// The content strategy agent.
pub struct ContentStrategyAgent {
    base: BaseAgent,
}

impl ContentStrategyAgent {
    pub const AGENT_ID: &'static str = "content_strategy";

    pub fn new(deps: &AgentDeps) -> Self {
        Self::with_fetcher(deps, Arc::new(HttpSiteFetcher::new()))
    }

    pub fn with_fetcher(deps: &AgentDeps, fetcher: Arc<dyn SiteFetcher>) -> Self {
        let base = BaseAgent::new(
            AgentConfig::new(Self::AGENT_ID, "Content Strategy Agent"),
            deps.broker.clone(),
        );
        let state = Arc::new(StrategyState {
            store: deps.store.clone(),
            fetcher,
        });

        let st = state.clone();
        base.register_task_handler("content_strategy_development", move |ctx| {
            let st = st.clone();
            async move { st.strategy_development(ctx).await }
        });
        let st = state.clone();
        base.register_task_handler("competitor_analysis", move |ctx| {
            let st = st.clone();
            async move { st.competitor_analysis(ctx).await }
        });
        let st = state.clone();
        base.register_task_handler("content_calendar_creation", move |ctx| {
            let st = st.clone();
            async move { st.calendar_creation(ctx).await }
        });

        Self { base }
    }

    pub fn base(&self) -> &BaseAgent {
        &self.base
    }
}

#[async_trait::async_trait]
impl Agent for ContentStrategyAgent {
    fn agent_id(&self) -> &str {
        Self::AGENT_ID
    }

    fn name(&self) -> &str {
        "Content Strategy Agent"
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

fn string_list(payload: &Value, field: &str) -> Vec<String> {
    payload
        .get(field)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

impl StrategyState {
    fn audit(&self, ctx: &TaskContext, action: &str, resource_id: &str) {
        let user = ctx.optional_str("user_id").unwrap_or("system").to_string();
        let entry = AuditEntry::new(user, action, "strategy", resource_id)
            .with_agent(ContentStrategyAgent::AGENT_ID);
        if let Err(e) = self.store.insert_audit(&entry) {
            debug!(error = %e, "audit insert failed");
        }
    }

    async fn strategy_development(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let topics = string_list(&ctx.payload, "content_topics");
        let project_types = string_list(&ctx.payload, "project_types");
        if topics.is_empty() {
            return Err(TaskError::validation("content_topics must not be empty"));
        }

        let mut themes = vec![json!({
            "name": "Cross-channel consistency",
            "description": "Keep voice and visual identity aligned across every channel",
        })];
        for topic in &topics {
            themes.push(json!({
                "name": format!("{topic} thought leadership"),
                "description": format!("Build authority on {topic} with recurring expert content"),
            }));
        }

        let recommendations: Vec<Value> = topics
            .iter()
            .map(|topic| {
                json!({
                    "topic": topic,
                    "angles": [
                        format!("How {topic} changes day-to-day marketing work"),
                        format!("Common {topic} mistakes and how to avoid them"),
                        format!("A practical {topic} playbook for small teams"),
                    ],
                    "keywords": [
                        topic.to_lowercase(),
                        format!("{} best practices", topic.to_lowercase()),
                        format!("{} guide", topic.to_lowercase()),
                    ],
                    "target_audience": {
                        "primary": "Marketing professionals",
                        "secondary": "Founders and growth teams",
                    },
                })
            })
            .collect();

        // Channels with no planned coverage are the gaps.
        let known_types = ["Blog", "Social Post", "Email", "Landing Page"];
        let gaps: Vec<&str> = known_types
            .iter()
            .filter(|t| !project_types.iter().any(|p| p == *t))
            .copied()
            .collect();

        self.audit(&ctx, "strategy_developed", &brand_id);
        info!(brand_id, topics = topics.len(), "strategy developed");

        Ok(json!({
            "brand_id": brand_id,
            "strategic_themes": themes,
            "topic_recommendations": recommendations,
            "content_gaps": gaps,
            "project_types": project_types,
        }))
    }

    async fn competitor_analysis(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let topics = string_list(&ctx.payload, "content_topics");
        let competitors = ctx
            .payload
            .get("competitors")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if competitors.is_empty() {
            return Err(TaskError::validation("competitors must not be empty"));
        }

        let mut analyses = Vec::new();
        for competitor in &competitors {
            let name = competitor
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            let website = competitor.get("website").and_then(|v| v.as_str());

            // Best-effort: a dead competitor site yields an empty profile.
            let enrichment = match website {
                Some(url) => enrich_from_website(&*self.fetcher, url).await,
                None => Default::default(),
            };
            let haystack = format!(
                "{} {}",
                enrichment.title.as_deref().unwrap_or(""),
                enrichment.description.as_deref().unwrap_or("")
            )
            .to_lowercase();
            let covered: Vec<&String> = topics
                .iter()
                .filter(|t| haystack.contains(&t.to_lowercase()))
                .collect();
            let gaps: Vec<&String> = topics
                .iter()
                .filter(|t| !haystack.contains(&t.to_lowercase()))
                .collect();

            analyses.push(json!({
                "competitor": name,
                "website": website,
                "site_title": enrichment.title,
                "site_description": enrichment.description,
                "topics_covered": covered,
                "topics_uncovered": gaps,
            }));
        }

        // Topics no competitor covers are open field.
        let opportunities: Vec<&String> = topics
            .iter()
            .filter(|topic| {
                analyses.iter().all(|a| {
                    a["topics_covered"]
                        .as_array()
                        .is_none_or(|covered| !covered.iter().any(|c| c == topic.as_str()))
                })
            })
            .collect();

        self.audit(&ctx, "competitor_analysis", &brand_id);

        Ok(json!({
            "brand_id": brand_id,
            "competitor_analyses": analyses,
            "opportunities": opportunities,
        }))
    }

    async fn calendar_creation(&self, ctx: TaskContext) -> TaskOutcome {
        let brand_id = ctx.require_str("brand_id")?.to_string();
        let topics = string_list(&ctx.payload, "content_topics");
        let project_types = string_list(&ctx.payload, "project_types");
        if project_types.is_empty() {
            return Err(TaskError::validation("project_types must not be empty"));
        }

        let timeframe = ctx
            .payload
            .get("timeframe")
            .ok_or_else(|| TaskError::validation("missing required field 'timeframe'"))?;
        let start = parse_date(timeframe, "start_date")?;
        let end = parse_date(timeframe, "end_date")?;
        if end < start {
            return Err(TaskError::validation("end_date precedes start_date"));
        }

        let frequencies: HashMap<String, f64> = ctx
            .payload
            .pointer("/scheduling_preferences/posting_frequency")
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                    .collect()
            })
            .unwrap_or_default();

        let plan = generate_calendar(&topics, &project_types, &frequencies, start, end);
        info!(
            brand_id,
            items = plan.content_items.len(),
            campaigns = plan.campaigns.len(),
            series = plan.series.len(),
            "calendar generated"
        );
        self.audit(&ctx, "calendar_created", &brand_id);

        Ok(json!({
            "brand_id": brand_id,
            "timeframe": timeframe,
            "content_items": plan.content_items,
            "campaigns": plan.campaigns,
            "series": plan.series,
            "distribution": plan.distribution,
        }))
    }
}

fn parse_date(timeframe: &Value, field: &str) -> Result<NaiveDate, TaskError> {
    let raw = timeframe
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| TaskError::validation(format!("timeframe missing '{field}'")))?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| TaskError::validation(format!("'{field}' must be YYYY-MM-DD, got '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn topics() -> Vec<String> {
        vec!["AI".to_string(), "SEO".to_string()]
    }

    fn types() -> Vec<String> {
        vec!["Blog".to_string(), "Social Post".to_string()]
    }

    #[test]
    fn test_quarter_calendar_meets_volume_contract() {
        // 2025-04-01..2025-06-30 spans thirteen scheduling weeks.
        let plan = generate_calendar(
            &topics(),
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-06-30"),
        );

        let blogs = plan
            .content_items
            .iter()
            .filter(|i| i.project_type == "Blog")
            .count();
        let social = plan
            .content_items
            .iter()
            .filter(|i| i.project_type == "Social Post")
            .count();
        assert!(blogs >= 12, "expected >= 12 blog items, got {blogs}");
        assert!(social >= 36, "expected >= 36 social items, got {social}");
    }

    #[test]
    fn test_no_item_past_range_end() {
        let end = date("2025-06-30");
        let plan = generate_calendar(
            &topics(),
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            end,
        );
        assert!(plan.content_items.iter().all(|i| i.scheduled_date <= end));
    }

    #[test]
    fn test_zero_length_range_produces_no_items() {
        let plan = generate_calendar(
            &topics(),
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-04-01"),
        );
        assert!(plan.content_items.is_empty());
        assert!(plan.campaigns.is_empty());
        assert!(plan.series.is_empty());
    }

    #[test]
    fn test_topics_rotate_across_weeks() {
        let plan = generate_calendar(
            &topics(),
            &vec!["Blog".to_string()],
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-04-28"),
        );
        let sequence: Vec<&str> = plan
            .content_items
            .iter()
            .map(|i| i.content_topic.as_str())
            .collect();
        // One blog per week, topic = topics[(week + 0) % 2].
        assert_eq!(sequence, vec!["AI", "SEO", "AI", "SEO"]);
    }

    #[test]
    fn test_fractional_frequency_schedules_sparsely() {
        let mut frequencies = HashMap::new();
        frequencies.insert("Landing Page".to_string(), 0.25);
        let plan = generate_calendar(
            &topics(),
            &vec!["Landing Page".to_string()],
            &frequencies,
            date("2025-04-01"),
            date("2025-06-30"),
        );
        // Once every four weeks over thirteen weeks: weeks 0, 4, 8, 12.
        assert_eq!(plan.content_items.len(), 4);
    }

    #[test]
    fn test_campaigns_for_month_plus_ranges() {
        let plan = generate_calendar(
            &vec!["AI".into(), "SEO".into(), "Email".into(), "Video".into()],
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-06-30"),
        );
        // Capped at three campaign themes.
        assert_eq!(plan.campaigns.len(), 3);
        assert_eq!(plan.campaigns[0].name, "AI Focus Month");
        assert!(!plan.campaigns[0].related_content_ids.is_empty());
    }

    #[test]
    fn test_no_campaigns_for_short_ranges() {
        let plan = generate_calendar(
            &topics(),
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-04-15"),
        );
        assert!(plan.campaigns.is_empty());
    }

    #[test]
    fn test_series_for_blog_with_three_items() {
        let plan = generate_calendar(
            &topics(),
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-06-30"),
        );
        let blog_series: Vec<&ContentSeries> = plan
            .series
            .iter()
            .filter(|s| s.project_type == "Blog")
            .collect();
        assert!(!blog_series.is_empty());
        let first = blog_series[0];
        assert_eq!(first.parts.len(), 3);
        assert_eq!(first.parts[0].part_number, 1);
        assert!(first.parts[0].title.contains("Fundamentals"));
        // Social posts never form a series.
        assert!(plan.series.iter().all(|s| s.project_type != "Social Post"));
    }

    #[test]
    fn test_distribution_rollups() {
        let plan = generate_calendar(
            &topics(),
            &types(),
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-06-30"),
        );
        let by_type = plan.distribution["by_project_type"].as_object().unwrap();
        let total: u64 = by_type.values().map(|v| v.as_u64().unwrap()).sum();
        assert_eq!(total as usize, plan.content_items.len());
        assert!(plan.distribution["by_month"]["2025-04"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_empty_topics_fall_back_to_general() {
        let plan = generate_calendar(
            &[],
            &vec!["Blog".to_string()],
            &HashMap::new(),
            date("2025-04-01"),
            date("2025-04-15"),
        );
        assert!(!plan.content_items.is_empty());
        assert!(plan.content_items.iter().all(|i| i.content_topic == "General"));
    }

    #[test]
    fn test_parse_date_validation() {
        let timeframe = json!({"start_date": "2025-04-01", "end_date": "soon"});
        assert!(parse_date(&timeframe, "start_date").is_ok());
        let err = parse_date(&timeframe, "end_date").unwrap_err();
        assert_eq!(err.kind, marketeer_core::ErrorKind::Validation);
        assert!(parse_date(&timeframe, "missing").is_err());
    }
}
