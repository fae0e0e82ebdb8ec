//! Domain events fanned out to webhooks after their unit of work commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    #[serde(rename = "ticket.created")]
    TicketCreated,
    #[serde(rename = "ticket.updated")]
    TicketUpdated,
    #[serde(rename = "ticket.resolved")]
    TicketResolved,
    #[serde(rename = "comment.created")]
    CommentCreated,
    #[serde(rename = "user.created")]
    UserCreated,
    #[serde(rename = "user.updated")]
    UserUpdated,
    #[serde(rename = "kb_article.published")]
    KbArticlePublished,
    #[serde(rename = "webhook.failed")]
    WebhookFailed,
}

impl EventName {
    pub const ALL: [EventName; 8] = [
        Self::TicketCreated,
        Self::TicketUpdated,
        Self::TicketResolved,
        Self::CommentCreated,
        Self::UserCreated,
        Self::UserUpdated,
        Self::KbArticlePublished,
        Self::WebhookFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TicketCreated => "ticket.created",
            Self::TicketUpdated => "ticket.updated",
            Self::TicketResolved => "ticket.resolved",
            Self::CommentCreated => "comment.created",
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::KbArticlePublished => "kb_article.published",
            Self::WebhookFailed => "webhook.failed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| format!("unknown event '{s}'"))
    }
}

/// A committed state change, ready for fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event: EventName,
    pub organization_id: Uuid,
    pub actor_id: Option<Uuid>,
    pub entity: Value,
    pub before: Option<Map<String, Value>>,
    pub after: Option<Map<String, Value>>,
    pub occurred_at: DateTime<Utc>,
}

impl DomainEvent {
    pub fn new(event: EventName, organization_id: Uuid, entity: Value) -> Self {
        Self {
            event,
            organization_id,
            actor_id: None,
            entity,
            before: None,
            after: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_actor(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_changes(
        mut self,
        before: Option<Map<String, Value>>,
        after: Option<Map<String, Value>>,
    ) -> Self {
        self.before = before;
        self.after = after;
        self
    }

    /// Wire payload for one delivery. The delivery id stays the same across
    /// retries so receivers can deduplicate.
    pub fn payload(&self, delivery_id: Uuid) -> Value {
        let mut body = json!({
            "event": self.event.as_str(),
            "delivery_id": delivery_id,
            "occurred_at": self.occurred_at.to_rfc3339(),
            "organization_id": self.organization_id,
            "actor_id": self.actor_id,
            "entity": self.entity,
        });
        if let Some(obj) = body.as_object_mut() {
            if let Some(before) = &self.before {
                obj.insert("before".into(), Value::Object(before.clone()));
            }
            if let Some(after) = &self.after {
                obj.insert("after".into(), Value::Object(after.clone()));
            }
        }
        body
    }
}
