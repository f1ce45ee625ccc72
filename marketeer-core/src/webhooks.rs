//! Webhook facility — registration and HMAC-signed fire-and-record dispatch.
//!
//! A webhook fires for event `E` iff it is active and subscribes to `E` or
//! to `*`. Dispatch never blocks the emitting operation: deliveries run on
//! their own tasks and results are recorded for observability. There are no
//! retries; consumers are expected to be idempotent.

use crate::error::{MarketeerError, WebhookError};
use crate::store::Store;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Outbound POST timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Subscription wildcard matching every event type.
pub const EVENT_WILDCARD: &str = "*";

/// A registered webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub webhook_id: Uuid,
    pub brand_id: String,
    pub url: String,
    /// Subscribed event types, possibly containing `*`.
    pub events: Vec<String>,
    /// HMAC secret; unsigned deliveries when absent.
    pub secret: Option<String>,
    /// Payload format. Only `json` is currently emitted.
    pub format: String,
    pub active: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl Webhook {
    pub fn new(
        brand_id: impl Into<String>,
        url: impl Into<String>,
        events: Vec<String>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            webhook_id: Uuid::new_v4(),
            brand_id: brand_id.into(),
            url: url.into(),
            events,
            secret: None,
            format: "json".to_string(),
            active: true,
            created_by: created_by.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Whether this webhook fires for `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.active
            && self
                .events
                .iter()
                .any(|e| e == event_type || e == EVENT_WILDCARD)
    }
}

/// One recorded delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub webhook_id: Uuid,
    pub event_type: String,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub delivered_at: DateTime<Utc>,
}

impl WebhookDelivery {
    pub fn succeeded(&self) -> bool {
        self.status_code.is_some_and(|s| (200..300).contains(&s)) && self.error.is_none()
    }
}

/// Trait seam for the outbound POST; tests substitute a mock.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> Result<u16, String>;
}

/// Real transport using reqwest.
pub struct HttpWebhookTransport {
    client: reqwest::Client,
}

impl HttpWebhookTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpWebhookTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookTransport for HttpWebhookTransport {
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> Result<u16, String> {
        let mut request = self
            .client
            .post(url)
            .timeout(timeout)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

/// Compute the base64 HMAC-SHA256 signature of a payload body.
pub fn sign_payload(secret: &str, body: &str) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::SigningFailed(e.to_string()))?;
    mac.update(body.as_bytes());
    Ok(B64.encode(mac.finalize().into_bytes()))
}

/// Build the canonical delivery body for an event.
pub fn canonical_body(
    event_type: &str,
    webhook_id: Uuid,
    timestamp: DateTime<Utc>,
    data: &Value,
) -> String {
    json!({
        "event_type": event_type,
        "webhook_id": webhook_id,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        "data": data,
    })
    .to_string()
}

/// Registers webhooks and dispatches signed event deliveries.
pub struct WebhookDispatcher {
    store: Arc<Store>,
    transport: Arc<dyn WebhookTransport>,
}

impl WebhookDispatcher {
    pub fn new(store: Arc<Store>, transport: Arc<dyn WebhookTransport>) -> Self {
        Self { store, transport }
    }

    pub fn register(&self, webhook: &Webhook) -> Result<(), MarketeerError> {
        if url::Url::parse(&webhook.url).is_err() {
            return Err(WebhookError::InvalidUrl {
                url: webhook.url.clone(),
            }
            .into());
        }
        self.store.insert_webhook(webhook)?;
        debug!(webhook_id = %webhook.webhook_id, brand_id = %webhook.brand_id, "webhook registered");
        Ok(())
    }

    pub fn unregister(&self, webhook_id: Uuid) -> Result<(), MarketeerError> {
        let removed = self.store.delete_webhook(webhook_id)?;
        if !removed {
            return Err(WebhookError::NotFound {
                webhook_id: webhook_id.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub fn webhooks_for_brand(&self, brand_id: &str) -> Result<Vec<Webhook>, MarketeerError> {
        Ok(self.store.webhooks_for_brand(brand_id)?)
    }

    /// The subscriber set for `(brand, event_type)` per the firing rule.
    pub fn subscribers(
        &self,
        brand_id: &str,
        event_type: &str,
    ) -> Result<Vec<Webhook>, MarketeerError> {
        Ok(self
            .store
            .webhooks_for_brand(brand_id)?
            .into_iter()
            .filter(|w| w.subscribes_to(event_type))
            .collect())
    }

    /// Fire-and-record: resolve subscribers and dispatch each delivery on
    /// its own task. Returns the number of deliveries spawned; the caller
    /// never blocks on delivery.
    pub fn trigger_event(
        &self,
        brand_id: &str,
        event_type: &str,
        payload: &Value,
    ) -> Result<usize, MarketeerError> {
        let subscribers = self.subscribers(brand_id, event_type)?;
        let count = subscribers.len();
        for webhook in subscribers {
            let store = self.store.clone();
            let transport = self.transport.clone();
            let event_type = event_type.to_string();
            let payload = payload.clone();
            tokio::spawn(async move {
                let delivery =
                    deliver(&*transport, &webhook, &event_type, &payload, Utc::now()).await;
                if !delivery.succeeded() {
                    warn!(
                        webhook_id = %delivery.webhook_id,
                        event_type = %delivery.event_type,
                        error = ?delivery.error,
                        status = ?delivery.status_code,
                        "webhook delivery failed"
                    );
                }
                if let Err(e) = store.insert_webhook_delivery(&delivery) {
                    warn!(error = %e, "failed to record webhook delivery");
                }
            });
        }
        Ok(count)
    }

    /// Deliver synchronously. Used by tests and by callers that want the
    /// delivery record inline.
    pub async fn deliver_now(
        &self,
        webhook: &Webhook,
        event_type: &str,
        payload: &Value,
        timestamp: DateTime<Utc>,
    ) -> WebhookDelivery {
        let delivery = deliver(&*self.transport, webhook, event_type, payload, timestamp).await;
        if let Err(e) = self.store.insert_webhook_delivery(&delivery) {
            warn!(error = %e, "failed to record webhook delivery");
        }
        delivery
    }
}

async fn deliver(
    transport: &dyn WebhookTransport,
    webhook: &Webhook,
    event_type: &str,
    payload: &Value,
    timestamp: DateTime<Utc>,
) -> WebhookDelivery {
    let started = std::time::Instant::now();
    let body = canonical_body(event_type, webhook.webhook_id, timestamp, payload);

    let mut headers = vec![("X-Webhook-Event".to_string(), event_type.to_string())];
    let mut signing_error = None;
    if let Some(secret) = &webhook.secret {
        match sign_payload(secret, &body) {
            Ok(signature) => headers.push(("X-Webhook-Signature".to_string(), signature)),
            Err(e) => signing_error = Some(e.to_string()),
        }
    }

    let (status_code, error) = if let Some(e) = signing_error {
        (None, Some(e))
    } else {
        match transport
            .post(&webhook.url, &headers, &body, DELIVERY_TIMEOUT)
            .await
        {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e)),
        }
    };

    WebhookDelivery {
        webhook_id: webhook.webhook_id,
        event_type: event_type.to_string(),
        status_code,
        error,
        duration_ms: started.elapsed().as_millis() as u64,
        delivered_at: timestamp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    struct MockTransport {
        status: u16,
        requests: Mutex<Vec<(String, Vec<(String, String)>, String)>>,
    }

    impl MockTransport {
        fn new(status: u16) -> Self {
            Self {
                status,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WebhookTransport for MockTransport {
        async fn post(
            &self,
            url: &str,
            headers: &[(String, String)],
            body: &str,
            _timeout: Duration,
        ) -> Result<u16, String> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), headers.to_vec(), body.to_string()));
            Ok(self.status)
        }
    }

    fn dispatcher(status: u16) -> (WebhookDispatcher, Arc<MockTransport>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let transport = Arc::new(MockTransport::new(status));
        (
            WebhookDispatcher::new(store, transport.clone()),
            transport,
        )
    }

    #[test]
    fn test_subscribes_to_exact_and_wildcard() {
        let exact = Webhook::new("b-1", "https://x.example/h", vec!["content.published".into()], "u-1");
        assert!(exact.subscribes_to("content.published"));
        assert!(!exact.subscribes_to("user_created"));

        let wildcard = Webhook::new("b-1", "https://x.example/h", vec![EVENT_WILDCARD.into()], "u-1");
        assert!(wildcard.subscribes_to("anything.at.all"));

        let mut inactive = Webhook::new("b-1", "https://x.example/h", vec![EVENT_WILDCARD.into()], "u-1");
        inactive.active = false;
        assert!(!inactive.subscribes_to("content.published"));
    }

    #[test]
    fn test_register_rejects_invalid_url() {
        let (dispatcher, _) = dispatcher(200);
        let webhook = Webhook::new("b-1", "not a url", vec!["*".into()], "u-1");
        assert!(matches!(
            dispatcher.register(&webhook),
            Err(MarketeerError::Webhook(WebhookError::InvalidUrl { .. }))
        ));
    }

    #[test]
    fn test_signature_matches_known_vector() {
        // HMAC-SHA256 over the exact emitted body, base64-encoded.
        let webhook_id = Uuid::nil();
        let ts = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let body = canonical_body("content.published", webhook_id, ts, &json!({"id": "c1"}));
        assert!(body.contains("\"timestamp\":\"2025-04-01T00:00:00Z\""));

        let signature = sign_payload("s3cr3t", &body).unwrap();

        let mut mac = HmacSha256::new_from_slice(b"s3cr3t").unwrap();
        mac.update(body.as_bytes());
        let expected = B64.encode(mac.finalize().into_bytes());
        assert_eq!(signature, expected);
    }

    #[tokio::test]
    async fn test_delivery_carries_signature_and_event_headers() {
        let (dispatcher, transport) = dispatcher(200);
        let webhook = Webhook::new(
            "b-1",
            "https://consumer.example/hook",
            vec!["content.published".into()],
            "u-1",
        )
        .with_secret("s3cr3t");
        dispatcher.register(&webhook).unwrap();

        let ts = Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap();
        let delivery = dispatcher
            .deliver_now(&webhook, "content.published", &json!({"id": "c1"}), ts)
            .await;
        assert!(delivery.succeeded());

        let requests = transport.requests.lock().unwrap();
        let (url, headers, body) = &requests[0];
        assert_eq!(url, "https://consumer.example/hook");
        let event_header = headers.iter().find(|(n, _)| n == "X-Webhook-Event").unwrap();
        assert_eq!(event_header.1, "content.published");
        let sig_header = headers
            .iter()
            .find(|(n, _)| n == "X-Webhook-Signature")
            .unwrap();
        assert_eq!(sig_header.1, sign_payload("s3cr3t", body).unwrap());
    }

    #[tokio::test]
    async fn test_unsigned_delivery_has_no_signature_header() {
        let (dispatcher, transport) = dispatcher(200);
        let webhook = Webhook::new("b-1", "https://x.example/h", vec!["*".into()], "u-1");
        dispatcher.register(&webhook).unwrap();

        dispatcher
            .deliver_now(&webhook, "user_created", &json!({}), Utc::now())
            .await;
        let requests = transport.requests.lock().unwrap();
        assert!(
            !requests[0]
                .1
                .iter()
                .any(|(n, _)| n == "X-Webhook-Signature")
        );
    }

    #[tokio::test]
    async fn test_trigger_event_resolves_exact_subscriber_set() {
        let (dispatcher, _) = dispatcher(200);
        let matching = Webhook::new("b-1", "https://a.example/h", vec!["content.published".into()], "u-1");
        let wildcard = Webhook::new("b-1", "https://b.example/h", vec!["*".into()], "u-1");
        let other_event = Webhook::new("b-1", "https://c.example/h", vec!["user_created".into()], "u-1");
        let other_brand = Webhook::new("b-2", "https://d.example/h", vec!["*".into()], "u-1");
        let mut inactive = Webhook::new("b-1", "https://e.example/h", vec!["*".into()], "u-1");
        inactive.active = false;

        for w in [&matching, &wildcard, &other_event, &other_brand, &inactive] {
            dispatcher.register(w).unwrap();
        }

        let subs = dispatcher.subscribers("b-1", "content.published").unwrap();
        let urls: Vec<&str> = subs.iter().map(|w| w.url.as_str()).collect();
        assert_eq!(subs.len(), 2);
        assert!(urls.contains(&"https://a.example/h"));
        assert!(urls.contains(&"https://b.example/h"));

        let spawned = dispatcher
            .trigger_event("b-1", "content.published", &json!({"id": "c1"}))
            .unwrap();
        assert_eq!(spawned, 2);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_recorded_not_raised() {
        let store = Arc::new(Store::open_in_memory().unwrap());

        struct FailTransport;
        #[async_trait]
        impl WebhookTransport for FailTransport {
            async fn post(
                &self,
                _url: &str,
                _headers: &[(String, String)],
                _body: &str,
                _timeout: Duration,
            ) -> Result<u16, String> {
                Err("connection refused".into())
            }
        }

        let dispatcher = WebhookDispatcher::new(store, Arc::new(FailTransport));
        let webhook = Webhook::new("b-1", "https://x.example/h", vec!["*".into()], "u-1");
        dispatcher.register(&webhook).unwrap();

        let delivery = dispatcher
            .deliver_now(&webhook, "content.published", &json!({}), Utc::now())
            .await;
        assert!(!delivery.succeeded());
        assert_eq!(delivery.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_unregister_missing_webhook() {
        let (dispatcher, _) = dispatcher(200);
        assert!(matches!(
            dispatcher.unregister(Uuid::new_v4()),
            Err(MarketeerError::Webhook(WebhookError::NotFound { .. }))
        ));
    }
}
