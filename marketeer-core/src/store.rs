//! SQLite persistence under the `umt` schema.
//!
//! SQLite has no schemas, so tables carry the `umt_` prefix. Integration
//! records route to per-category account tables (`umt_social_accounts`,
//! `umt_cms_accounts`, `umt_ad_accounts`); health history and the audit
//! log are append-only. Brand, project, and content aggregates are opaque
//! to the core and persist as JSON documents.

use crate::apikeys::ApiKeyRecord;
use crate::audit::{AuditEntry, AuditQuery};
use crate::error::StoreError;
use crate::integration::{
    HealthCheckRecord, HealthStatus, IntegrationRecord, PlatformCategory,
};
use crate::webhooks::{Webhook, WebhookDelivery};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

const ACCOUNT_TABLES: &[&str] = &["umt_social_accounts", "umt_cms_accounts", "umt_ad_accounts"];

fn account_table(category: PlatformCategory) -> &'static str {
    match category {
        PlatformCategory::Social => "umt_social_accounts",
        PlatformCategory::Cms => "umt_cms_accounts",
        PlatformCategory::Advertising => "umt_ad_accounts",
    }
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::SchemaInit(format!("bad timestamp '{raw}': {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    raw.map(|r| parse_ts(&r)).transpose()
}

/// SQLite-backed store shared by the agents of one process.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and ensure the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database. Used by tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Poisoning only happens if a holder panicked; the connection
        // itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create every table the core owns.
    pub fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock();
        for table in ACCOUNT_TABLES {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    integration_id TEXT PRIMARY KEY,
                    brand_id TEXT NOT NULL,
                    platform TEXT NOT NULL,
                    credentials TEXT NOT NULL,
                    health_status TEXT NOT NULL,
                    last_health_check TEXT,
                    token_expires_at TEXT,
                    consecutive_failures INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_brand ON {table}(brand_id);"
            ))
            .map_err(|e| StoreError::SchemaInit(e.to_string()))?;
        }
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS umt_integration_health (
                integration_id TEXT NOT NULL,
                check_time TEXT NOT NULL,
                status TEXT NOT NULL,
                response_time_ms INTEGER NOT NULL,
                error_message TEXT,
                details TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_health_integration
                ON umt_integration_health(integration_id, check_time);

            CREATE TABLE IF NOT EXISTS umt_webhooks (
                webhook_id TEXT PRIMARY KEY,
                brand_id TEXT NOT NULL,
                url TEXT NOT NULL,
                events TEXT NOT NULL,
                secret TEXT,
                format TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_webhooks_brand ON umt_webhooks(brand_id);

            CREATE TABLE IF NOT EXISTS umt_webhook_deliveries (
                webhook_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                status_code INTEGER,
                error TEXT,
                duration_ms INTEGER NOT NULL,
                delivered_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS umt_api_keys (
                key_id TEXT PRIMARY KEY,
                brand_id TEXT NOT NULL,
                name TEXT NOT NULL,
                hashed_secret TEXT NOT NULL,
                salt TEXT NOT NULL,
                scopes TEXT NOT NULL,
                tier TEXT NOT NULL,
                rate_limit_per_minute INTEGER NOT NULL,
                active INTEGER NOT NULL,
                expires_at TEXT,
                last_used_at TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_keys_brand ON umt_api_keys(brand_id);

            CREATE TABLE IF NOT EXISTS umt_audit_log (
                entry_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                action TEXT NOT NULL,
                resource_type TEXT NOT NULL,
                resource_id TEXT NOT NULL,
                previous_state TEXT,
                new_state TEXT,
                ip TEXT,
                agent TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_user ON umt_audit_log(user_id, timestamp);

            CREATE TABLE IF NOT EXISTS umt_brands (
                brand_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS umt_projects (
                project_id TEXT PRIMARY KEY,
                brand_id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_projects_brand ON umt_projects(brand_id);

            CREATE TABLE IF NOT EXISTS umt_project_types (
                name TEXT PRIMARY KEY,
                description TEXT NOT NULL,
                created_at TEXT NOT NULL
            );",
        )
        .map_err(|e| StoreError::SchemaInit(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Integrations
    // -----------------------------------------------------------------------

    pub fn upsert_integration(&self, record: &IntegrationRecord) -> Result<(), StoreError> {
        let table = account_table(record.category);
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT INTO {table}
                    (integration_id, brand_id, platform, credentials, health_status,
                     last_health_check, token_expires_at, consecutive_failures,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(integration_id) DO UPDATE SET
                    credentials = excluded.credentials,
                    health_status = excluded.health_status,
                    last_health_check = excluded.last_health_check,
                    token_expires_at = excluded.token_expires_at,
                    consecutive_failures = excluded.consecutive_failures,
                    updated_at = excluded.updated_at"
            ),
            params![
                record.integration_id.to_string(),
                record.brand_id,
                record.platform,
                serde_json::to_string(&record.credentials)?,
                record.health_status.to_string(),
                record.last_health_check.map(ts),
                record.token_expires_at.map(ts),
                record.consecutive_failures,
                ts(record.created_at),
                ts(record.updated_at),
            ],
        )?;
        Ok(())
    }

    fn integration_from_row(
        row: &rusqlite::Row<'_>,
        category: PlatformCategory,
    ) -> rusqlite::Result<(IntegrationRecord, Option<String>, Option<String>)> {
        let integration_id: String = row.get(0)?;
        let credentials: String = row.get(3)?;
        let health_status: String = row.get(4)?;
        let last_health_check: Option<String> = row.get(5)?;
        let token_expires_at: Option<String> = row.get(6)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;

        let record = IntegrationRecord {
            integration_id: integration_id.parse().unwrap_or_else(|_| Uuid::nil()),
            brand_id: row.get(1)?,
            platform: row.get(2)?,
            category,
            credentials: serde_json::from_str(&credentials).unwrap_or_default(),
            health_status: health_status.parse().unwrap_or(HealthStatus::Pending),
            last_health_check: None,
            token_expires_at: None,
            consecutive_failures: row.get(7)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        };
        Ok((record, last_health_check, token_expires_at))
    }

    fn finish_integration(
        parts: (IntegrationRecord, Option<String>, Option<String>),
    ) -> Result<IntegrationRecord, StoreError> {
        let (mut record, last_check, token_expires) = parts;
        record.last_health_check = parse_opt_ts(last_check)?;
        record.token_expires_at = parse_opt_ts(token_expires)?;
        Ok(record)
    }

    pub fn get_integration(&self, id: Uuid) -> Result<Option<IntegrationRecord>, StoreError> {
        let conn = self.lock();
        for (table, category) in [
            ("umt_social_accounts", PlatformCategory::Social),
            ("umt_cms_accounts", PlatformCategory::Cms),
            ("umt_ad_accounts", PlatformCategory::Advertising),
        ] {
            let row = conn
                .query_row(
                    &format!("SELECT * FROM {table} WHERE integration_id = ?1"),
                    params![id.to_string()],
                    |row| Self::integration_from_row(row, category),
                )
                .optional()?;
            if let Some(parts) = row {
                return Ok(Some(Self::finish_integration(parts)?));
            }
        }
        Ok(None)
    }

    pub fn get_integration_by_brand_platform(
        &self,
        brand_id: &str,
        platform: &str,
    ) -> Result<Option<IntegrationRecord>, StoreError> {
        let Some(category) = PlatformCategory::for_platform(platform) else {
            return Ok(None);
        };
        let table = account_table(category);
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT * FROM {table}
                     WHERE brand_id = ?1 AND LOWER(platform) = LOWER(?2)"
                ),
                params![brand_id, platform],
                |row| Self::integration_from_row(row, category),
            )
            .optional()?;
        row.map(Self::finish_integration).transpose()
    }

    pub fn integrations_for_brand(
        &self,
        brand_id: &str,
    ) -> Result<Vec<IntegrationRecord>, StoreError> {
        self.collect_integrations(Some(brand_id))
    }

    pub fn all_integrations(&self) -> Result<Vec<IntegrationRecord>, StoreError> {
        self.collect_integrations(None)
    }

    fn collect_integrations(
        &self,
        brand_id: Option<&str>,
    ) -> Result<Vec<IntegrationRecord>, StoreError> {
        let conn = self.lock();
        let mut out = Vec::new();
        for (table, category) in [
            ("umt_social_accounts", PlatformCategory::Social),
            ("umt_cms_accounts", PlatformCategory::Cms),
            ("umt_ad_accounts", PlatformCategory::Advertising),
        ] {
            let sql = match brand_id {
                Some(_) => format!("SELECT * FROM {table} WHERE brand_id = ?1"),
                None => format!("SELECT * FROM {table}"),
            };
            let mut stmt = conn.prepare(&sql)?;
            let mapped: Vec<_> = match brand_id {
                Some(b) => stmt
                    .query_map(params![b], |row| Self::integration_from_row(row, category))?
                    .collect::<rusqlite::Result<_>>()?,
                None => stmt
                    .query_map([], |row| Self::integration_from_row(row, category))?
                    .collect::<rusqlite::Result<_>>()?,
            };
            for parts in mapped {
                out.push(Self::finish_integration(parts)?);
            }
        }
        Ok(out)
    }

    pub fn delete_integration(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        for table in ACCOUNT_TABLES {
            let n = conn.execute(
                &format!("DELETE FROM {table} WHERE integration_id = ?1"),
                params![id.to_string()],
            )?;
            if n > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append a health history row and update the owning record's
    /// `(health_status, last_health_check)` in one transaction.
    pub fn record_health_check(
        &self,
        record: &IntegrationRecord,
        check: &HealthCheckRecord,
        consecutive_failures: u32,
    ) -> Result<(), StoreError> {
        let table = account_table(record.category);
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO umt_integration_health
                (integration_id, check_time, status, response_time_ms, error_message, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                check.integration_id.to_string(),
                ts(check.check_time),
                check.status.to_string(),
                check.response_time_ms as i64,
                check.error_message,
                serde_json::to_string(&check.details)?,
            ],
        )?;
        tx.execute(
            &format!(
                "UPDATE {table}
                 SET health_status = ?2, last_health_check = ?3,
                     consecutive_failures = ?4, updated_at = ?5
                 WHERE integration_id = ?1"
            ),
            params![
                record.integration_id.to_string(),
                check.status.to_string(),
                ts(check.check_time),
                consecutive_failures,
                ts(Utc::now()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn health_history(
        &self,
        integration_id: Uuid,
        limit: usize,
    ) -> Result<Vec<HealthCheckRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT integration_id, check_time, status, response_time_ms, error_message, details
             FROM umt_integration_health
             WHERE integration_id = ?1
             ORDER BY check_time DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![integration_id.to_string(), limit as i64], |row| {
            let id: String = row.get(0)?;
            let check_time: String = row.get(1)?;
            let status: String = row.get(2)?;
            let details: String = row.get(5)?;
            Ok(HealthCheckRecord {
                integration_id: id.parse().unwrap_or_else(|_| Uuid::nil()),
                check_time: DateTime::parse_from_rfc3339(&check_time)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                status: status.parse().unwrap_or(HealthStatus::Pending),
                response_time_ms: row.get::<_, i64>(3)?.max(0) as u64,
                error_message: row.get(4)?,
                details: serde_json::from_str(&details).unwrap_or(Value::Null),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -----------------------------------------------------------------------
    // Webhooks
    // -----------------------------------------------------------------------

    pub fn insert_webhook(&self, webhook: &Webhook) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO umt_webhooks
                (webhook_id, brand_id, url, events, secret, format, active, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                webhook.webhook_id.to_string(),
                webhook.brand_id,
                webhook.url,
                serde_json::to_string(&webhook.events)?,
                webhook.secret,
                webhook.format,
                webhook.active as i64,
                webhook.created_by,
                ts(webhook.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn webhooks_for_brand(&self, brand_id: &str) -> Result<Vec<Webhook>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT webhook_id, brand_id, url, events, secret, format, active, created_by, created_at
             FROM umt_webhooks WHERE brand_id = ?1",
        )?;
        let rows = stmt.query_map(params![brand_id], |row| {
            let webhook_id: String = row.get(0)?;
            let events: String = row.get(3)?;
            let active: i64 = row.get(6)?;
            let created_at: String = row.get(8)?;
            Ok(Webhook {
                webhook_id: webhook_id.parse().unwrap_or_else(|_| Uuid::nil()),
                brand_id: row.get(1)?,
                url: row.get(2)?,
                events: serde_json::from_str(&events).unwrap_or_default(),
                secret: row.get(4)?,
                format: row.get(5)?,
                active: active != 0,
                created_by: row.get(7)?,
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn delete_webhook(&self, webhook_id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM umt_webhooks WHERE webhook_id = ?1",
            params![webhook_id.to_string()],
        )?;
        Ok(n > 0)
    }

    pub fn insert_webhook_delivery(&self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO umt_webhook_deliveries
                (webhook_id, event_type, status_code, error, duration_ms, delivered_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                delivery.webhook_id.to_string(),
                delivery.event_type,
                delivery.status_code,
                delivery.error,
                delivery.duration_ms as i64,
                ts(delivery.delivered_at),
            ],
        )?;
        Ok(())
    }

    pub fn webhook_deliveries(&self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT webhook_id, event_type, status_code, error, duration_ms, delivered_at
             FROM umt_webhook_deliveries WHERE webhook_id = ?1 ORDER BY delivered_at",
        )?;
        let rows = stmt.query_map(params![webhook_id.to_string()], |row| {
            let id: String = row.get(0)?;
            let delivered_at: String = row.get(5)?;
            Ok(WebhookDelivery {
                webhook_id: id.parse().unwrap_or_else(|_| Uuid::nil()),
                event_type: row.get(1)?,
                status_code: row.get(2)?,
                error: row.get(3)?,
                duration_ms: row.get::<_, i64>(4)?.max(0) as u64,
                delivered_at: DateTime::parse_from_rfc3339(&delivered_at)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -----------------------------------------------------------------------
    // API keys
    // -----------------------------------------------------------------------

    pub fn insert_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO umt_api_keys
                (key_id, brand_id, name, hashed_secret, salt, scopes, tier,
                 rate_limit_per_minute, active, expires_at, last_used_at, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                record.key_id,
                record.brand_id,
                record.name,
                record.hashed_secret,
                record.salt,
                serde_json::to_string(&record.scopes)?,
                record.tier.to_string(),
                record.rate_limit_per_minute,
                record.active as i64,
                record.expires_at.map(ts),
                record.last_used_at.map(ts),
                record.created_by,
                ts(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn update_api_key(&self, record: &ApiKeyRecord) -> Result<(), StoreError> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE umt_api_keys
             SET name = ?2, scopes = ?3, tier = ?4, rate_limit_per_minute = ?5,
                 active = ?6, expires_at = ?7, last_used_at = ?8
             WHERE key_id = ?1",
            params![
                record.key_id,
                record.name,
                serde_json::to_string(&record.scopes)?,
                record.tier.to_string(),
                record.rate_limit_per_minute,
                record.active as i64,
                record.expires_at.map(ts),
                record.last_used_at.map(ts),
            ],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                entity: "api_key",
                id: record.key_id.clone(),
            });
        }
        Ok(())
    }

    fn api_key_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApiKeyRecord> {
        let scopes: String = row.get(5)?;
        let tier: String = row.get(6)?;
        let active: i64 = row.get(8)?;
        let expires_at: Option<String> = row.get(9)?;
        let last_used_at: Option<String> = row.get(10)?;
        let created_at: String = row.get(12)?;
        Ok(ApiKeyRecord {
            key_id: row.get(0)?,
            brand_id: row.get(1)?,
            name: row.get(2)?,
            hashed_secret: row.get(3)?,
            salt: row.get(4)?,
            scopes: serde_json::from_str(&scopes).unwrap_or_default(),
            tier: match tier.as_str() {
                "premium" => crate::apikeys::KeyTier::Premium,
                "enterprise" => crate::apikeys::KeyTier::Enterprise,
                _ => crate::apikeys::KeyTier::Standard,
            },
            rate_limit_per_minute: row.get(7)?,
            active: active != 0,
            expires_at: expires_at.and_then(|r| {
                DateTime::parse_from_rfc3339(&r)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            last_used_at: last_used_at.and_then(|r| {
                DateTime::parse_from_rfc3339(&r)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }),
            created_by: row.get(11)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn get_api_key(&self, key_id: &str) -> Result<Option<ApiKeyRecord>, StoreError> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT key_id, brand_id, name, hashed_secret, salt, scopes, tier,
                        rate_limit_per_minute, active, expires_at, last_used_at,
                        created_by, created_at
                 FROM umt_api_keys WHERE key_id = ?1",
                params![key_id],
                Self::api_key_from_row,
            )
            .optional()?)
    }

    pub fn api_keys_for_brand(&self, brand_id: &str) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key_id, brand_id, name, hashed_secret, salt, scopes, tier,
                    rate_limit_per_minute, active, expires_at, last_used_at,
                    created_by, created_at
             FROM umt_api_keys WHERE brand_id = ?1",
        )?;
        let rows = stmt.query_map(params![brand_id], Self::api_key_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    pub fn all_active_api_keys(&self) -> Result<Vec<ApiKeyRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT key_id, brand_id, name, hashed_secret, salt, scopes, tier,
                    rate_limit_per_minute, active, expires_at, last_used_at,
                    created_by, created_at
             FROM umt_api_keys WHERE active = 1",
        )?;
        let rows = stmt.query_map([], Self::api_key_from_row)?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    // -----------------------------------------------------------------------
    // Audit log
    // -----------------------------------------------------------------------

    pub fn insert_audit(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO umt_audit_log
                (entry_id, user_id, action, resource_type, resource_id,
                 previous_state, new_state, ip, agent, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                entry.entry_id.to_string(),
                entry.user_id,
                entry.action,
                entry.resource_type,
                entry.resource_id,
                entry
                    .previous_state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                entry
                    .new_state
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                entry.ip,
                entry.agent,
                ts(entry.timestamp),
            ],
        )?;
        Ok(())
    }

    pub fn query_audit(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT entry_id, user_id, action, resource_type, resource_id,
                    previous_state, new_state, ip, agent, timestamp
             FROM umt_audit_log ORDER BY timestamp",
        )?;
        let rows = stmt.query_map([], |row| {
            let entry_id: String = row.get(0)?;
            let previous_state: Option<String> = row.get(5)?;
            let new_state: Option<String> = row.get(6)?;
            let timestamp: String = row.get(9)?;
            Ok(AuditEntry {
                entry_id: entry_id.parse().unwrap_or_else(|_| Uuid::nil()),
                user_id: row.get(1)?,
                action: row.get(2)?,
                resource_type: row.get(3)?,
                resource_id: row.get(4)?,
                previous_state: previous_state.and_then(|s| serde_json::from_str(&s).ok()),
                new_state: new_state.and_then(|s| serde_json::from_str(&s).ok()),
                ip: row.get(7)?,
                agent: row.get(8)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        let mut entries: Vec<AuditEntry> = rows
            .collect::<rusqlite::Result<Vec<_>>>()?
            .into_iter()
            .filter(|e| query.matches(e))
            .collect();
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    // -----------------------------------------------------------------------
    // Brands / projects (opaque aggregates)
    // -----------------------------------------------------------------------

    pub fn upsert_brand(&self, brand_id: &str, data: &Value) -> Result<(), StoreError> {
        let conn = self.lock();
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO umt_brands (brand_id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(brand_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![brand_id, serde_json::to_string(data)?, now],
        )?;
        Ok(())
    }

    pub fn get_brand(&self, brand_id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM umt_brands WHERE brand_id = ?1",
                params![brand_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn upsert_project(
        &self,
        project_id: &str,
        brand_id: &str,
        data: &Value,
    ) -> Result<(), StoreError> {
        let conn = self.lock();
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO umt_projects (project_id, brand_id, data, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(project_id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at",
            params![project_id, brand_id, serde_json::to_string(data)?, now],
        )?;
        Ok(())
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<Value>, StoreError> {
        let conn = self.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT data FROM umt_projects WHERE project_id = ?1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    pub fn projects_for_brand(&self, brand_id: &str) -> Result<Vec<Value>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT data FROM umt_projects WHERE brand_id = ?1")?;
        let rows = stmt.query_map(params![brand_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for raw in rows {
            out.push(serde_json::from_str(&raw?)?);
        }
        Ok(out)
    }

    pub fn create_project_type(&self, name: &str, description: &str) -> Result<(), StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR IGNORE INTO umt_project_types (name, description, created_at)
             VALUES (?1, ?2, ?3)",
            params![name, description, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn project_types(&self) -> Result<Vec<(String, String)>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT name, description FROM umt_project_types ORDER BY name")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::EncryptedField;
    use serde_json::json;
    use std::collections::HashMap;

    fn sample_integration() -> IntegrationRecord {
        let mut creds = HashMap::new();
        creds.insert(
            "access_token".to_string(),
            EncryptedField {
                ciphertext: "ct".into(),
                salt: "st".into(),
                generation: 1,
            },
        );
        IntegrationRecord::new("b-1", "linkedin", PlatformCategory::Social, creds)
    }

    #[test]
    fn test_integration_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_integration();
        store.upsert_integration(&record).unwrap();

        let loaded = store.get_integration(record.integration_id).unwrap().unwrap();
        assert_eq!(loaded.brand_id, "b-1");
        assert_eq!(loaded.platform, "linkedin");
        assert_eq!(loaded.category, PlatformCategory::Social);
        assert_eq!(loaded.health_status, HealthStatus::Pending);
        assert_eq!(loaded.credentials.len(), 1);
    }

    #[test]
    fn test_lookup_by_brand_platform_case_insensitive() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_integration(&sample_integration()).unwrap();
        let found = store
            .get_integration_by_brand_platform("b-1", "LinkedIn")
            .unwrap();
        assert!(found.is_some());
        assert!(
            store
                .get_integration_by_brand_platform("b-1", "twitter")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_integrations_route_to_category_tables() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_integration(&sample_integration()).unwrap();
        let cms = IntegrationRecord::new("b-1", "wordpress", PlatformCategory::Cms, HashMap::new());
        store.upsert_integration(&cms).unwrap();
        let ads = IntegrationRecord::new(
            "b-1",
            "google_ads",
            PlatformCategory::Advertising,
            HashMap::new(),
        );
        store.upsert_integration(&ads).unwrap();

        let all = store.integrations_for_brand("b-1").unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_delete_integration() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_integration();
        store.upsert_integration(&record).unwrap();
        assert!(store.delete_integration(record.integration_id).unwrap());
        assert!(!store.delete_integration(record.integration_id).unwrap());
        assert!(store.get_integration(record.integration_id).unwrap().is_none());
    }

    #[test]
    fn test_record_health_check_updates_atomically() {
        let store = Store::open_in_memory().unwrap();
        let record = sample_integration();
        store.upsert_integration(&record).unwrap();

        let check = HealthCheckRecord {
            integration_id: record.integration_id,
            check_time: Utc::now(),
            status: HealthStatus::Degraded,
            response_time_ms: 420,
            error_message: Some("rate limited".into()),
            details: json!({"status_code": 429}),
        };
        store.record_health_check(&record, &check, 1).unwrap();

        let loaded = store.get_integration(record.integration_id).unwrap().unwrap();
        assert_eq!(loaded.health_status, HealthStatus::Degraded);
        assert!(loaded.last_health_check.is_some());
        assert_eq!(loaded.consecutive_failures, 1);

        let history = store.health_history(record.integration_id, 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].response_time_ms, 420);
    }

    #[test]
    fn test_webhook_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let webhook = Webhook::new("b-1", "https://x.example/h", vec!["*".into()], "u-1")
            .with_secret("shh");
        store.insert_webhook(&webhook).unwrap();

        let loaded = store.webhooks_for_brand("b-1").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].secret.as_deref(), Some("shh"));
        assert!(store.delete_webhook(webhook.webhook_id).unwrap());
    }

    #[test]
    fn test_audit_insert_and_query() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_audit(&AuditEntry::new("u-1", "token_refreshed", "integration", "i-1"))
            .unwrap();
        store
            .insert_audit(&AuditEntry::new("u-2", "brand_onboarded", "brand", "b-1"))
            .unwrap();

        let refreshed = store
            .query_audit(&AuditQuery::new().for_action("token_refreshed"))
            .unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].user_id, "u-1");
    }

    #[test]
    fn test_brand_and_project_documents() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_brand("b-1", &json!({"company_name": "Acme"}))
            .unwrap();
        store
            .upsert_project("p-1", "b-1", &json!({"name": "Spring", "status": "draft"}))
            .unwrap();

        assert_eq!(
            store.get_brand("b-1").unwrap().unwrap()["company_name"],
            "Acme"
        );
        assert_eq!(store.projects_for_brand("b-1").unwrap().len(), 1);
        assert!(store.get_project("p-404").unwrap().is_none());
    }

    #[test]
    fn test_project_types() {
        let store = Store::open_in_memory().unwrap();
        store.create_project_type("Blog", "Long-form article").unwrap();
        store.create_project_type("Blog", "duplicate ignored").unwrap();
        let types = store.project_types().unwrap();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].0, "Blog");
    }
}
