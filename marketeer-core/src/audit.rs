//! Audit log — append-only action trail per user and resource.
//!
//! Rows are immutable once recorded. Admin queries consume them read-only;
//! the core never branches on audit content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One immutable audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub user_id: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
    pub ip: Option<String>,
    pub agent: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        user_id: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            user_id: user_id.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            previous_state: None,
            new_state: None,
            ip: None,
            agent: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_states(mut self, previous: Option<Value>, new: Option<Value>) -> Self {
        self.previous_state = previous;
        self.new_state = new;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }
}

/// Filtering criteria for read-only audit queries.
///
/// Builder-style so admin callers can compose predicates fluently.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub user_id: Option<String>,
    pub action: Option<String>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn for_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn for_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn since(mut self, dt: DateTime<Utc>) -> Self {
        self.since = Some(dt);
        self
    }

    pub fn until(mut self, dt: DateTime<Utc>) -> Self {
        self.until = Some(dt);
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Whether an entry satisfies every non-`None` predicate.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(ref user) = self.user_id
            && entry.user_id != *user
        {
            return false;
        }
        if let Some(ref action) = self.action
            && entry.action != *action
        {
            return false;
        }
        if let Some(ref rt) = self.resource_type
            && entry.resource_type != *rt
        {
            return false;
        }
        if let Some(ref rid) = self.resource_id
            && entry.resource_id != *rid
        {
            return false;
        }
        if let Some(since) = self.since
            && entry.timestamp < since
        {
            return false;
        }
        if let Some(until) = self.until
            && entry.timestamp > until
        {
            return false;
        }
        true
    }
}
