//! Marketeer integrations — pluggable outbound clients for CMS, social,
//! and advertising platforms.
//!
//! Every platform implements the [`adapter::IntegrationAdapter`] verbs over
//! a shared retrying HTTP seam; health checks map responses onto the
//! integration health model owned by `marketeer-core`.

pub mod adapter;
pub mod ads;
pub mod cms;
pub mod health;
pub mod http;
pub mod social;

pub use adapter::{
    AdapterContext, AdapterError, AdapterFactory, AdapterOutcome, AdapterResult, ContentPayload,
    CredentialSource, IntegrationAdapter, StaticTokenSource, with_auth_retry,
};
pub use health::{HealthCheck, probe};
pub use http::{
    HttpMethod, ReqwestRestClient, RestClient, RestRequest, RestResponse, RetrySchedule,
    ensure_success,
};
