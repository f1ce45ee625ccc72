//! Marketeer core — the agent runtime and collaboration substrate.
//!
//! This crate holds the parts every agent stands on: the broker client and
//! message envelope, the keyed cache, the credential vault, the webhook and
//! API-key facility, the audit log, the persistence store, and the base
//! agent runtime with its dispatch, correlation, and circuit-breaking
//! machinery. Domain behavior lives in `marketeer-agents`; outbound
//! platform clients live in `marketeer-integrations`.

pub mod apikeys;
pub mod audit;
pub mod auth;
pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod integration;
pub mod message;
pub mod runtime;
pub mod store;
pub mod sync;
pub mod vault;
pub mod webhooks;

pub use apikeys::{ApiKeyManager, ApiKeyRecord, KeyTier, RateLimitStatus};
pub use audit::{AuditEntry, AuditQuery};
pub use auth::{OAuthClient, OAuthProviderConfig, OAuthToken, SessionTokens};
pub use broker::{Ack, Broker, ConsumerCallback, ExchangeKind, MemoryBroker};
pub use cache::{Cache, MemoryCache};
pub use config::AppConfig;
pub use error::{ErrorKind, MarketeerError, Result, TaskError};
pub use integration::{HealthCheckRecord, HealthStatus, IntegrationRecord, PlatformCategory};
pub use message::{Envelope, Message, ResponseStatus};
pub use runtime::{Agent, AgentConfig, BaseAgent, EventContext, TaskContext, TaskOutcome};
pub use store::Store;
pub use sync::{KeyedMutex, SingleFlight};
pub use vault::{CredentialVault, EncryptedField};
pub use webhooks::{Webhook, WebhookDispatcher, WebhookTransport};
