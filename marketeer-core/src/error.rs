//! Error types for the Marketeer core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the broker, cache, vault, webhook, API-key, store, and agent
//! runtime domains. Task-level failures travel as a [`TaskError`] carrying
//! an [`ErrorKind`] — the response envelope serializer is the only place
//! that flattens it to JSON.

use serde::{Deserialize, Serialize};

/// Top-level error type for the Marketeer core library.
#[derive(Debug, thiserror::Error)]
pub enum MarketeerError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("API key error: {0}")]
    ApiKey(#[from] ApiKeyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the message broker client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Unknown exchange: {name}")]
    UnknownExchange { name: String },

    #[error("Unknown queue: {name}")]
    UnknownQueue { name: String },

    #[error("Queue '{name}' already has a consumer")]
    ConsumerExists { name: String },

    #[error("Publish to '{exchange}' failed after {attempts} attempts: {message}")]
    PublishFailed {
        exchange: String,
        attempts: usize,
        message: String,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },
}

/// Errors from the cache layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Value for '{key}' is not a counter")]
    NotACounter { key: String },
}

/// Errors from the credential vault.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("Encryption failed: {0}")]
    EncryptFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptFailed(String),

    #[error("Unknown key generation: {0}")]
    UnknownGeneration(u32),

    #[error("Vault secret not configured (set MARKETEER_VAULT_SECRET)")]
    MissingSecret,

    #[error("Vault secret too short: need at least {min} bytes, got {got}")]
    WeakSecret { min: usize, got: usize },

    #[error("Malformed encrypted field: {0}")]
    MalformedField(String),
}

/// Errors from webhook registration and dispatch.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook not found: {webhook_id}")]
    NotFound { webhook_id: String },

    #[error("Invalid webhook URL: {url}")]
    InvalidUrl { url: String },

    #[error("Delivery to {url} failed: {message}")]
    DeliveryFailed { url: String, message: String },

    #[error("Signing failed: {0}")]
    SigningFailed(String),
}

/// Errors from API key management and validation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiKeyError {
    #[error("API key name is required")]
    NameRequired,

    #[error("Unsupported scope: {scope}")]
    UnsupportedScope { scope: String },

    #[error("Malformed API key")]
    Malformed,

    #[error("Invalid API key")]
    Invalid,

    #[error("API key is inactive")]
    Inactive,

    #[error("API key has expired")]
    Expired,

    #[error("API key is missing required scope: {scope}")]
    MissingScope { scope: String },

    #[error("Rate limit exceeded for key {key_id}")]
    RateLimited { key_id: String },
}

/// Errors from the persistence store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Row not found: {entity} '{id}'")]
    NotFound { entity: &'static str, id: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Schema init failed: {0}")]
    SchemaInit(String),
}

/// Errors from the agent runtime.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent '{agent_id}' is not running")]
    NotRunning { agent_id: String },

    #[error("Agent '{agent_id}' is already running")]
    AlreadyRunning { agent_id: String },

    #[error("No response within {timeout_secs}s for task '{task_type}'")]
    ResponseTimeout { task_type: String, timeout_secs: u64 },

    #[error("Task failed: {0}")]
    Task(#[from] TaskError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}")]
    EnvVarMissing { var: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },

    #[error("Unsupported JWT algorithm: {algorithm}")]
    UnsupportedJwtAlgorithm { algorithm: String },
}

/// Errors from user-auth token issuance and verification.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Unknown OAuth provider: {provider}")]
    UnknownProvider { provider: String },

    #[error("Token exchange with {provider} failed: {message}")]
    ExchangeFailed { provider: String, message: String },

    #[error("Token refresh with {provider} failed: {message}")]
    RefreshFailed { provider: String, message: String },

    #[error("Invalid token: {0}")]
    InvalidToken(String),
}

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Classification of a task failure, carried verbatim in the response
/// envelope. Kinds map to HTTP status families only at the (out-of-scope)
/// API edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed payload or missing required fields. Never retried.
    Validation,
    /// Missing or invalid credential, expired token.
    Auth,
    /// Unknown brand/project/integration id. Never retried.
    NotFound,
    /// Business-rule violation (e.g. publishing non-approved content).
    Conflict,
    /// Integration adapter returned a non-retryable upstream failure.
    Upstream,
    /// Broker/HTTP/DB transport failure after retries were exhausted.
    Transport,
    /// Handler or awaited response exceeded its deadline.
    Timeout,
    /// Unexpected failure; logged with trace, feeds the circuit breaker.
    Internal,
}

impl ErrorKind {
    /// The HTTP status family this kind maps to at the API surface.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Auth => 401,
            ErrorKind::NotFound => 404,
            ErrorKind::Conflict => 409,
            ErrorKind::Upstream => 502,
            ErrorKind::Transport => 503,
            ErrorKind::Timeout => 504,
            ErrorKind::Internal => 500,
        }
    }

    /// Whether a failure of this kind should feed the per-handler circuit
    /// breaker. Caller errors (validation, not-found, conflict) do not.
    pub fn feeds_breaker(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::Internal | ErrorKind::Timeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{tag}")
    }
}

/// A task failure as carried in the response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    pub fn auth(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    pub fn upstream(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, detail)
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, detail)
    }

    /// The fast-fail error returned while a handler's circuit is open.
    pub fn unavailable(handler: &str) -> Self {
        Self::new(
            ErrorKind::Transport,
            format!("handler '{handler}' unavailable: circuit open"),
        )
    }

    /// The error returned when no handler is registered for a task type.
    pub fn unhandled(task_type: &str) -> Self {
        Self::new(
            ErrorKind::NotFound,
            format!("unhandled task type '{task_type}'"),
        )
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => {
                TaskError::not_found(format!("{entity} '{id}' not found"))
            }
            other => TaskError::internal(other.to_string()),
        }
    }
}

impl From<VaultError> for TaskError {
    fn from(e: VaultError) -> Self {
        TaskError::internal(e.to_string())
    }
}

/// A type alias for results using the top-level `MarketeerError`.
pub type Result<T> = std::result::Result<T, MarketeerError>;
