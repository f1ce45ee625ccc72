//! API key facility — issue, validate, and rate-limit per-brand keys.
//!
//! Only the salted hash of a key's secret ever persists; the plaintext is
//! returned exactly once at creation. Validation compares hashes in
//! constant time and fails closed on expiry. Rate limiting is a fixed
//! per-minute window backed by the cache's atomic counters; without a
//! cache backend requests are allowed and the status is marked disabled.

use crate::cache::Cache;
use crate::error::{ApiKeyError, MarketeerError};
use crate::store::Store;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Scopes an API key may carry.
pub const SUPPORTED_SCOPES: &[&str] = &[
    "read:content",
    "write:content",
    "read:analytics",
    "write:analytics",
    "read:campaigns",
    "write:campaigns",
    "read:integrations",
    "write:integrations",
    "read:projects",
    "write:projects",
    "read:users",
    "write:users",
    "read:webhooks",
    "write:webhooks",
];

/// Visible prefix on every issued key.
const KEY_PREFIX: &str = "mk_";
/// Secret length in bytes (256 bits minimum per the issuing contract).
const SECRET_LEN: usize = 32;
/// How long a successful validation may be served from cache.
const VALIDATION_CACHE_TTL: Duration = Duration::from_secs(60);
/// Rate-limit counters outlive their window so a rolled-over bucket can
/// still be inspected.
const RATE_COUNTER_TTL: Duration = Duration::from_secs(120);

/// Pricing tier, which sets the default per-minute rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyTier {
    Standard,
    Premium,
    Enterprise,
}

impl KeyTier {
    pub fn default_rate_limit(&self) -> u32 {
        match self {
            KeyTier::Standard => 60,
            KeyTier::Premium => 300,
            KeyTier::Enterprise => 1000,
        }
    }
}

impl std::fmt::Display for KeyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyTier::Standard => write!(f, "standard"),
            KeyTier::Premium => write!(f, "premium"),
            KeyTier::Enterprise => write!(f, "enterprise"),
        }
    }
}

/// An API key as persisted. The secret itself is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key_id: String,
    pub brand_id: String,
    pub name: String,
    /// Hex SHA-256 of `secret ‖ salt`.
    pub hashed_secret: String,
    /// Hex random salt.
    pub salt: String,
    pub scopes: Vec<String>,
    pub tier: KeyTier,
    pub rate_limit_per_minute: u32,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// Result of creating a key: the record plus the one-time plaintext.
#[derive(Debug, Clone)]
pub struct CreatedApiKey {
    pub record: ApiKeyRecord,
    /// `mk_<key_id>.<secret>` — returned exactly once, never persisted.
    pub plaintext: String,
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub limit: u32,
    pub current: u32,
    pub remaining: u32,
    pub reset_after_secs: u64,
    /// True when no cache backend is configured (fail-open).
    pub disabled: bool,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hash_secret(secret: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(salt.as_bytes());
    hex_encode(&hasher.finalize())
}

/// Issues and validates API keys.
pub struct ApiKeyManager {
    store: Arc<Store>,
    cache: Option<Arc<dyn Cache>>,
}

impl ApiKeyManager {
    pub fn new(store: Arc<Store>, cache: Option<Arc<dyn Cache>>) -> Self {
        Self { store, cache }
    }

    fn generate() -> (String, String, String) {
        let mut id_bytes = [0u8; 6];
        OsRng.fill_bytes(&mut id_bytes);
        let key_id = hex_encode(&id_bytes);

        let mut secret_bytes = [0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret_bytes);
        let secret = URL_SAFE_NO_PAD.encode(secret_bytes);

        let plaintext = format!("{KEY_PREFIX}{key_id}.{secret}");
        (key_id, secret, plaintext)
    }

    fn parse_presented(presented: &str) -> Result<(&str, &str), ApiKeyError> {
        let trimmed = presented
            .strip_prefix(KEY_PREFIX)
            .ok_or(ApiKeyError::Malformed)?;
        trimmed.split_once('.').ok_or(ApiKeyError::Malformed)
    }

    /// Create a key. The returned plaintext is the only copy that will ever
    /// exist.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        brand_id: &str,
        name: &str,
        scopes: Option<Vec<String>>,
        tier: KeyTier,
        rate_limit_per_minute: Option<u32>,
        expires_at: Option<DateTime<Utc>>,
        created_by: &str,
    ) -> Result<CreatedApiKey, MarketeerError> {
        if name.trim().is_empty() {
            return Err(ApiKeyError::NameRequired.into());
        }
        let scopes = match scopes {
            Some(scopes) => {
                for scope in &scopes {
                    if !SUPPORTED_SCOPES.contains(&scope.as_str()) {
                        return Err(ApiKeyError::UnsupportedScope {
                            scope: scope.clone(),
                        }
                        .into());
                    }
                }
                scopes
            }
            None => SUPPORTED_SCOPES.iter().map(|s| s.to_string()).collect(),
        };

        let (key_id, secret, plaintext) = Self::generate();
        let mut salt_bytes = [0u8; 16];
        OsRng.fill_bytes(&mut salt_bytes);
        let salt = hex_encode(&salt_bytes);

        let record = ApiKeyRecord {
            key_id,
            brand_id: brand_id.to_string(),
            name: name.to_string(),
            hashed_secret: hash_secret(&secret, &salt),
            salt,
            scopes,
            tier,
            rate_limit_per_minute: rate_limit_per_minute.unwrap_or_else(|| tier.default_rate_limit()),
            active: true,
            expires_at,
            last_used_at: None,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        };
        self.store.insert_api_key(&record)?;
        debug!(key_id = %record.key_id, brand_id, "api key created");
        Ok(CreatedApiKey { record, plaintext })
    }

    pub fn list_for_brand(&self, brand_id: &str) -> Result<Vec<ApiKeyRecord>, MarketeerError> {
        Ok(self.store.api_keys_for_brand(brand_id)?)
    }

    pub fn revoke(&self, key_id: &str) -> Result<(), MarketeerError> {
        let mut record = self
            .store
            .get_api_key(key_id)?
            .ok_or(ApiKeyError::Invalid)?;
        record.active = false;
        self.store.update_api_key(&record)?;
        Ok(())
    }

    /// Validate a presented key, optionally requiring a scope. Fails closed
    /// on expiry: a key expiring precisely at `now` is rejected.
    pub async fn validate(
        &self,
        presented: &str,
        required_scope: Option<&str>,
    ) -> Result<ApiKeyRecord, MarketeerError> {
        self.validate_at(presented, required_scope, Utc::now()).await
    }

    async fn validate_at(
        &self,
        presented: &str,
        required_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ApiKeyRecord, MarketeerError> {
        let cache_key = format!("apikey_valid:{presented}");
        if let Some(cache) = &self.cache
            && let Some(cached) = cache.get(&cache_key).await
            && let Some(key_id) = cached.as_str()
            && let Some(record) = self.store.get_api_key(key_id)?
        {
            // Re-check the cheap predicates so revocation and expiry take
            // effect within the cache window.
            Self::check_usable(&record, required_scope, now)?;
            return Ok(record);
        }

        let record = self.find_matching(presented)?;
        Self::check_usable(&record, required_scope, now)?;

        let mut touched = record.clone();
        touched.last_used_at = Some(now);
        self.store.update_api_key(&touched)?;

        if let Some(cache) = &self.cache {
            cache
                .set(
                    &cache_key,
                    json!(touched.key_id),
                    Some(VALIDATION_CACHE_TTL),
                )
                .await;
        }
        Ok(touched)
    }

    fn find_matching(&self, presented: &str) -> Result<ApiKeyRecord, MarketeerError> {
        let (key_id, secret) = Self::parse_presented(presented)?;

        // Fast path: the visible key-id prefix addresses the record.
        if let Some(record) = self.store.get_api_key(key_id)? {
            let computed = hash_secret(secret, &record.salt);
            if bool::from(computed.as_bytes().ct_eq(record.hashed_secret.as_bytes())) {
                return Ok(record);
            }
            return Err(ApiKeyError::Invalid.into());
        }

        // Fallback: compare against every active key in constant time.
        for record in self.store.all_active_api_keys()? {
            let computed = hash_secret(secret, &record.salt);
            if bool::from(computed.as_bytes().ct_eq(record.hashed_secret.as_bytes())) {
                return Ok(record);
            }
        }
        Err(ApiKeyError::Invalid.into())
    }

    fn check_usable(
        record: &ApiKeyRecord,
        required_scope: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), ApiKeyError> {
        if !record.active {
            return Err(ApiKeyError::Inactive);
        }
        if record.expires_at.is_some_and(|at| now >= at) {
            return Err(ApiKeyError::Expired);
        }
        if let Some(scope) = required_scope
            && !record.scopes.iter().any(|s| s == scope)
        {
            return Err(ApiKeyError::MissingScope {
                scope: scope.to_string(),
            });
        }
        Ok(())
    }

    /// Check and consume one admission from the key's per-minute window.
    pub async fn check_rate_limit(&self, record: &ApiKeyRecord) -> RateLimitStatus {
        self.check_rate_limit_at(record, Utc::now()).await
    }

    async fn check_rate_limit_at(
        &self,
        record: &ApiKeyRecord,
        now: DateTime<Utc>,
    ) -> RateLimitStatus {
        let limit = record.rate_limit_per_minute;
        let reset_after_secs = 60 - (now.timestamp().rem_euclid(60)) as u64;

        let Some(cache) = &self.cache else {
            return RateLimitStatus {
                allowed: true,
                limit,
                current: 0,
                remaining: limit,
                reset_after_secs,
                disabled: true,
            };
        };

        let bucket = now.timestamp().div_euclid(60);
        let counter_key = format!("ratelimit:{}:{}", record.key_id, bucket);
        let count = cache.incr(&counter_key, Some(RATE_COUNTER_TTL)).await;
        let count = u32::try_from(count.max(0)).unwrap_or(u32::MAX);

        let allowed = count <= limit;
        RateLimitStatus {
            allowed,
            limit,
            current: count.min(limit),
            remaining: limit.saturating_sub(count),
            reset_after_secs,
            disabled: false,
        }
    }
}
