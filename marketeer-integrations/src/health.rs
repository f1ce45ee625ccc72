//! Health checking — verdict mapping and probe plumbing.
//!
//! Verdicts follow the outbound contract: 2xx is healthy, 429/5xx is
//! degraded, 401 is unhealthy with `auth_error` set, and a transport
//! failure is unhealthy. Every check yields a history row; the caller
//! persists it and the record update atomically.

use crate::adapter::AdapterError;
use crate::http::{RestClient, RestRequest};
use chrono::Utc;
use marketeer_core::integration::{HealthCheckRecord, HealthStatus, PlatformCategory};
use serde_json::{Value, json};
use std::time::Instant;
use uuid::Uuid;

/// Outcome of one adapter health probe.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub response_time_ms: u64,
    pub auth_error: bool,
    pub error_message: Option<String>,
    pub details: Value,
}

impl HealthCheck {
    /// Map an HTTP status to the health verdict.
    pub fn from_status(status: u16, response_time_ms: u64) -> Self {
        let (verdict, auth_error, error_message) = match status {
            200..=299 => (HealthStatus::Healthy, false, None),
            401 => (
                HealthStatus::Unhealthy,
                true,
                Some("authentication failed".to_string()),
            ),
            429 => (
                HealthStatus::Degraded,
                false,
                Some("rate limited".to_string()),
            ),
            s if s >= 500 => (
                HealthStatus::Degraded,
                false,
                Some(format!("server error {s}")),
            ),
            s => (
                HealthStatus::Unhealthy,
                false,
                Some(format!("unexpected status {s}")),
            ),
        };
        Self {
            status: verdict,
            response_time_ms,
            auth_error,
            error_message,
            details: json!({"status_code": status}),
        }
    }

    /// A transport failure never reached the platform.
    pub fn from_transport_error(message: impl Into<String>, response_time_ms: u64) -> Self {
        let message = message.into();
        Self {
            status: HealthStatus::Unhealthy,
            response_time_ms,
            auth_error: false,
            error_message: Some(message.clone()),
            details: json!({"transport_error": message}),
        }
    }

    /// The append-only history row for this check.
    pub fn to_record(&self, integration_id: Uuid) -> HealthCheckRecord {
        HealthCheckRecord {
            integration_id,
            check_time: Utc::now(),
            status: self.status,
            response_time_ms: self.response_time_ms,
            error_message: self.error_message.clone(),
            details: json!({
                "auth_error": self.auth_error,
                "details": self.details,
            }),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Execute a probe request and map the outcome to a verdict.
pub async fn probe(
    rest: &dyn RestClient,
    category: PlatformCategory,
    request: RestRequest,
) -> HealthCheck {
    let started = Instant::now();
    match rest.execute(category, request).await {
        Ok(response) => {
            HealthCheck::from_status(response.status, started.elapsed().as_millis() as u64)
        }
        Err(AdapterError::RateLimited { message }) => {
            // The local token bucket refused the call; the platform itself
            // was not consulted.
            let mut check = HealthCheck::from_status(429, started.elapsed().as_millis() as u64);
            check.error_message = Some(message);
            check
        }
        Err(e) => HealthCheck::from_transport_error(e.to_string(), started.elapsed().as_millis() as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_2xx_healthy() {
        let check = HealthCheck::from_status(200, 12);
        assert_eq!(check.status, HealthStatus::Healthy);
        assert!(!check.auth_error);
        assert!(check.error_message.is_none());
    }

    #[test]
    fn test_verdict_429_and_5xx_degraded() {
        assert_eq!(HealthCheck::from_status(429, 1).status, HealthStatus::Degraded);
        assert_eq!(HealthCheck::from_status(500, 1).status, HealthStatus::Degraded);
        assert_eq!(HealthCheck::from_status(503, 1).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_verdict_401_unhealthy_with_auth_flag() {
        let check = HealthCheck::from_status(401, 1);
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert!(check.auth_error);
    }

    #[test]
    fn test_verdict_other_4xx_unhealthy_without_auth_flag() {
        let check = HealthCheck::from_status(404, 1);
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert!(!check.auth_error);
    }

    #[test]
    fn test_transport_error_unhealthy() {
        let check = HealthCheck::from_transport_error("connection refused", 9);
        assert_eq!(check.status, HealthStatus::Unhealthy);
        assert_eq!(check.error_message.as_deref(), Some("connection refused"));
        assert_eq!(check.details["transport_error"], "connection refused");
    }

    #[test]
    fn test_history_row_carries_auth_flag() {
        let check = HealthCheck::from_status(401, 33);
        let record = check.to_record(Uuid::new_v4());
        assert_eq!(record.status, HealthStatus::Unhealthy);
        assert_eq!(record.response_time_ms, 33);
        assert_eq!(record.details["auth_error"], true);
    }
}
