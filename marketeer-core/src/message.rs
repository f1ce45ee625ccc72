//! Message envelope carried on the broker.
//!
//! A message holds exactly one of a task, event, or response envelope.
//! The wire representation is flat UTF-8 JSON; deserialization rejects
//! frames that carry more than one envelope identity, or none.

use crate::error::TaskError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome tag on a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// The three envelope shapes a message can carry.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Directed message expecting one response.
    Task {
        task_id: Uuid,
        task_type: String,
        target_agent_id: String,
    },
    /// Fanout message expecting no response.
    Event { event_id: Uuid, event_type: String },
    /// Correlated reply to a task.
    Response {
        response_to: Uuid,
        status: ResponseStatus,
        result: Option<Value>,
        error: Option<TaskError>,
    },
}

/// Envelope carried on the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage", into = "WireMessage")]
pub struct Message {
    pub message_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sender_agent_id: String,
    pub envelope: Envelope,
    /// Opaque payload map. Empty object for responses.
    pub payload: Value,
    /// Opaque trace propagation carrier.
    pub trace_context: HashMap<String, String>,
}

impl Message {
    /// Build a task message addressed to `target`.
    pub fn task(
        sender: impl Into<String>,
        target: impl Into<String>,
        task_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sender_agent_id: sender.into(),
            envelope: Envelope::Task {
                task_id: Uuid::new_v4(),
                task_type: task_type.into(),
                target_agent_id: target.into(),
            },
            payload,
            trace_context: HashMap::new(),
        }
    }

    /// Build a broadcast event message.
    pub fn event(sender: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sender_agent_id: sender.into(),
            envelope: Envelope::Event {
                event_id: Uuid::new_v4(),
                event_type: event_type.into(),
            },
            payload,
            trace_context: HashMap::new(),
        }
    }

    /// Build the response to a task message, addressed back to its sender.
    /// The request's trace context is propagated onto the response.
    pub fn response(request: &Message, outcome: std::result::Result<Value, TaskError>) -> Self {
        let (status, result, error) = match outcome {
            Ok(v) => (ResponseStatus::Success, Some(v), None),
            Err(e) => (ResponseStatus::Error, None, Some(e)),
        };
        Self {
            message_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            sender_agent_id: request.target_agent_id().unwrap_or("unknown").to_string(),
            envelope: Envelope::Response {
                response_to: request.message_id,
                status,
                result,
                error,
            },
            payload: Value::Object(serde_json::Map::new()),
            trace_context: request.trace_context.clone(),
        }
    }

    pub fn with_trace(mut self, trace_context: HashMap<String, String>) -> Self {
        self.trace_context = trace_context;
        self
    }

    pub fn is_task(&self) -> bool {
        matches!(self.envelope, Envelope::Task { .. })
    }

    pub fn is_event(&self) -> bool {
        matches!(self.envelope, Envelope::Event { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.envelope, Envelope::Response { .. })
    }

    pub fn task_type(&self) -> Option<&str> {
        match &self.envelope {
            Envelope::Task { task_type, .. } => Some(task_type),
            _ => None,
        }
    }

    pub fn event_type(&self) -> Option<&str> {
        match &self.envelope {
            Envelope::Event { event_type, .. } => Some(event_type),
            _ => None,
        }
    }

    pub fn target_agent_id(&self) -> Option<&str> {
        match &self.envelope {
            Envelope::Task {
                target_agent_id, ..
            } => Some(target_agent_id),
            _ => None,
        }
    }

    pub fn response_to(&self) -> Option<Uuid> {
        match &self.envelope {
            Envelope::Response { response_to, .. } => Some(*response_to),
            _ => None,
        }
    }

    /// The routing key this message publishes under: target agent id for
    /// tasks, event type for events. Responses route under the requester's
    /// id, which only the dispatching side knows, so they have no intrinsic
    /// key.
    pub fn routing_key(&self) -> Option<&str> {
        match &self.envelope {
            Envelope::Task {
                target_agent_id, ..
            } => Some(target_agent_id),
            Envelope::Event { event_type, .. } => Some(event_type),
            Envelope::Response { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Wire representation
// ---------------------------------------------------------------------------

/// Flat wire shape. Exactly one of {task, event, response} identity must be
/// present; `TryFrom` enforces the invariant on inbound frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    message_id: Uuid,
    timestamp: DateTime<Utc>,
    sender_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    response_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<ResponseStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<TaskError>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    trace_context: HashMap<String, String>,
}

impl From<Message> for WireMessage {
    fn from(msg: Message) -> Self {
        let mut wire = WireMessage {
            message_id: msg.message_id,
            timestamp: msg.timestamp,
            sender_agent_id: msg.sender_agent_id,
            task_id: None,
            task_type: None,
            target_agent_id: None,
            event_id: None,
            event_type: None,
            response_to: None,
            status: None,
            result: None,
            error: None,
            payload: msg.payload,
            trace_context: msg.trace_context,
        };
        match msg.envelope {
            Envelope::Task {
                task_id,
                task_type,
                target_agent_id,
            } => {
                wire.task_id = Some(task_id);
                wire.task_type = Some(task_type);
                wire.target_agent_id = Some(target_agent_id);
            }
            Envelope::Event {
                event_id,
                event_type,
            } => {
                wire.event_id = Some(event_id);
                wire.event_type = Some(event_type);
            }
            Envelope::Response {
                response_to,
                status,
                result,
                error,
            } => {
                wire.response_to = Some(response_to);
                wire.status = Some(status);
                wire.result = result;
                wire.error = error;
            }
        }
        wire
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(wire: WireMessage) -> std::result::Result<Self, String> {
        let has_task = wire.task_id.is_some() || wire.task_type.is_some();
        let has_event = wire.event_id.is_some() || wire.event_type.is_some();
        let has_response = wire.response_to.is_some();

        let identities = [has_task, has_event, has_response]
            .iter()
            .filter(|b| **b)
            .count();
        if identities != 1 {
            return Err(format!(
                "message {} must carry exactly one envelope, found {}",
                wire.message_id, identities
            ));
        }

        let envelope = if has_task {
            Envelope::Task {
                task_id: wire.task_id.ok_or("task frame missing task_id")?,
                task_type: wire.task_type.ok_or("task frame missing task_type")?,
                target_agent_id: wire
                    .target_agent_id
                    .ok_or("task frame missing target_agent_id")?,
            }
        } else if has_event {
            Envelope::Event {
                event_id: wire.event_id.ok_or("event frame missing event_id")?,
                event_type: wire.event_type.ok_or("event frame missing event_type")?,
            }
        } else {
            Envelope::Response {
                response_to: wire.response_to.ok_or("response frame missing response_to")?,
                status: wire.status.ok_or("response frame missing status")?,
                result: wire.result,
                error: wire.error,
            }
        };

        let payload = match wire.payload {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };

        Ok(Message {
            message_id: wire.message_id,
            timestamp: wire.timestamp,
            sender_agent_id: wire.sender_agent_id,
            envelope,
            payload,
            trace_context: wire.trace_context,
        })
    }
}
