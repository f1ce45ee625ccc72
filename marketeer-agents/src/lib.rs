//! Marketeer agents — the five role-specific agents built on the
//! `marketeer-core` runtime.
//!
//! Each agent is a thin handler registry over a [`BaseAgent`]: the auth &
//! integration agent owns credentials and health, the brand & project
//! agent owns onboarding and webhooks, the strategy agent plans calendars,
//! the creation agent generates and tests variations, and the content & ad
//! agent publishes and monitors.
//!
//! [`BaseAgent`]: marketeer_core::runtime::BaseAgent

use marketeer_core::broker::Broker;
use marketeer_core::cache::Cache;
use marketeer_core::config::AppConfig;
use marketeer_core::store::Store;
use marketeer_core::vault::CredentialVault;
use std::sync::Arc;

pub mod auth_integration;
pub mod brand_project;
pub mod content_ad;
pub mod content_creation;
pub mod enrich;
pub mod strategy;

pub use auth_integration::AuthIntegrationAgent;
pub use brand_project::BrandProjectAgent;
pub use content_ad::ContentAdAgent;
pub use content_creation::ContentCreationAgent;
pub use strategy::ContentStrategyAgent;

/// Shared process infrastructure handed to every agent.
#[derive(Clone)]
pub struct AgentDeps {
    pub broker: Arc<dyn Broker>,
    pub cache: Arc<dyn Cache>,
    pub store: Arc<Store>,
    pub vault: Arc<CredentialVault>,
    pub config: Arc<AppConfig>,
}

/// Agent ids accepted by the supervisor, in boot order.
pub const ALL_AGENT_IDS: &[&str] = &[
    AuthIntegrationAgent::AGENT_ID,
    BrandProjectAgent::AGENT_ID,
    ContentStrategyAgent::AGENT_ID,
    ContentCreationAgent::AGENT_ID,
    ContentAdAgent::AGENT_ID,
];
