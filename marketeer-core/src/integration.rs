//! Integration records — a stored credential + platform binding per
//! (brand, platform) pair, with health state and check history.

use crate::vault::EncryptedField;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Category a platform belongs to. Drives retry backoff bases and
/// credential validation rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformCategory {
    Social,
    Cms,
    Advertising,
}

impl PlatformCategory {
    /// Resolve the category for a platform string (case-insensitive).
    pub fn for_platform(platform: &str) -> Option<Self> {
        match platform.to_ascii_lowercase().as_str() {
            "linkedin" | "twitter" | "facebook" | "instagram" => Some(Self::Social),
            "wordpress" | "shopify" => Some(Self::Cms),
            "facebook_ads" | "google_ads" => Some(Self::Advertising),
            _ => None,
        }
    }
}

impl std::fmt::Display for PlatformCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Social => write!(f, "social"),
            Self::Cms => write!(f, "cms"),
            Self::Advertising => write!(f, "advertising"),
        }
    }
}

/// Health verdict for an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Pending,
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(format!("unknown health status '{other}'")),
        }
    }
}

/// A stored credential + platform binding for one (brand, platform) pair.
///
/// Created by the auth/integration agent; mutated only by the background
/// health monitor or explicit update tasks; destroyed on explicit removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationRecord {
    pub integration_id: Uuid,
    pub brand_id: String,
    pub platform: String,
    pub category: PlatformCategory,
    /// Per-field ciphertext; plaintext never persists.
    pub credentials: HashMap<String, EncryptedField>,
    pub health_status: HealthStatus,
    pub last_health_check: Option<DateTime<Utc>>,
    /// Set when the stored credential carries an expiring access token.
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Consecutive refresh/health failures, for the two-strike rule.
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IntegrationRecord {
    pub fn new(
        brand_id: impl Into<String>,
        platform: impl Into<String>,
        category: PlatformCategory,
        credentials: HashMap<String, EncryptedField>,
    ) -> Self {
        let now = Utc::now();
        Self {
            integration_id: Uuid::new_v4(),
            brand_id: brand_id.into(),
            platform: platform.into(),
            category,
            credentials,
            health_status: HealthStatus::Pending,
            last_health_check: None,
            token_expires_at: None,
            consecutive_failures: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the stored token is expired at `now`. A token expiring
    /// precisely at `now` is treated as expired (fail closed).
    pub fn token_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at.is_some_and(|at| now >= at)
    }

    /// Whether the token is within the refresh window (`expires_at − 5 min`).
    pub fn token_needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.token_expires_at
            .is_some_and(|at| now >= at - chrono::Duration::minutes(5))
    }
}

/// Append-only health check history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckRecord {
    pub integration_id: Uuid,
    pub check_time: DateTime<Utc>,
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
    pub details: Value,
}
