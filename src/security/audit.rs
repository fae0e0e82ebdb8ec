//! Audit recorder.
//!
//! Writes one `audit_records` row per state change, on the same unit of work
//! as the change itself, so a rollback takes the audit row with it. Events
//! attached to an entry are published only after the unit of work commits.

use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::core::error::GovernanceError;
use crate::core::events::{DomainEvent, EventName};
use crate::core::gateway::{TenantGateway, UnitOfWork};
use crate::core::session::SessionContext;
use crate::core::shared::models::AuditRecord;
use crate::security::webhook::WebhookDispatcher;

pub const REDACTED: &str = "***";

const DEFAULT_SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "password_hash",
    "secret",
    "webhook_secret",
    "api_key",
    "api_token",
    "token",
    "access_token",
    "refresh_token",
];

/// One state change to record.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub event: Option<EventName>,
}

impl AuditEntry {
    pub fn new(action: &str, entity_type: &str, entity_id: &str) -> Self {
        Self {
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            before: None,
            after: None,
            event: None,
        }
    }

    pub fn created(entity_type: &str, entity_id: &str, after: Value) -> Self {
        Self {
            after: Some(after),
            ..Self::new(&format!("{entity_type}.created"), entity_type, entity_id)
        }
    }

    pub fn updated(entity_type: &str, entity_id: &str, before: Value, after: Value) -> Self {
        Self {
            before: Some(before),
            after: Some(after),
            ..Self::new(&format!("{entity_type}.updated"), entity_type, entity_id)
        }
    }

    pub fn deleted(entity_type: &str, entity_id: &str, before: Value) -> Self {
        Self {
            before: Some(before),
            ..Self::new(&format!("{entity_type}.deleted"), entity_type, entity_id)
        }
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.action = action.to_string();
        self
    }

    pub fn with_event(mut self, event: EventName) -> Self {
        self.event = Some(event);
        self
    }
}

#[derive(Clone)]
pub struct AuditRecorder {
    sensitive_fields: HashSet<String>,
    dispatcher: Option<Arc<WebhookDispatcher>>,
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditRecorder {
    pub fn new() -> Self {
        Self {
            sensitive_fields: DEFAULT_SENSITIVE_FIELDS
                .iter()
                .map(|f| (*f).to_string())
                .collect(),
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<WebhookDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_sensitive_field(mut self, field: &str) -> Self {
        self.sensitive_fields.insert(field.to_ascii_lowercase());
        self
    }

    pub fn is_sensitive(&self, field: &str) -> bool {
        self.sensitive_fields.contains(&field.to_ascii_lowercase())
    }

    /// Appends the audit row on `uow`. The actor and request metadata come
    /// from the unit of work's session.
    pub fn record(
        &self,
        uow: &mut UnitOfWork,
        entry: AuditEntry,
    ) -> Result<AuditRecord, GovernanceError> {
        let session = uow.session().clone();
        let (old_values, new_values) = shallow_diff(entry.before.as_ref(), entry.after.as_ref());
        let old_values = old_values.map(|m| self.redact_map(m));
        let new_values = new_values.map(|m| self.redact_map(m));

        let record = AuditRecord {
            id: Uuid::new_v4(),
            organization_id: session.organization_id,
            actor_id: Some(session.user_id),
            action: entry.action.clone(),
            entity_type: entry.entity_type.clone(),
            entity_id: entry.entity_id.clone(),
            old_values: old_values.clone().map(Value::Object),
            new_values: new_values.clone().map(Value::Object),
            ip_address: session.request_ip.clone(),
            user_agent: session.user_agent.clone(),
            created_at: Utc::now(),
        };

        uow.write()?.insert_audit_record(&record).map_err(|e| {
            error!(
                org_id = %session.organization_id,
                action = %record.action,
                entity_id = %record.entity_id,
                "Audit write failed: {}",
                e
            );
            GovernanceError::AuditWriteFailed(e.to_string())
        })?;

        if let Some(event) = entry.event {
            let entity = entry
                .after
                .as_ref()
                .or(entry.before.as_ref())
                .map(|v| self.redact(v.clone()))
                .unwrap_or(Value::Null);
            uow.enqueue(
                DomainEvent::new(event, session.organization_id, entity)
                    .with_actor(session.user_id)
                    .with_changes(old_values, new_values),
            );
        }

        debug!(action = %record.action, entity_id = %record.entity_id, "Audit record appended");
        Ok(record)
    }

    /// Commits the unit of work, then hands its events to the fan-out.
    pub fn commit(&self, uow: UnitOfWork) -> Result<usize, GovernanceError> {
        let snapshot = uow.session().snapshot();
        let events = uow.commit()?;
        let published = events.len();
        if let Some(dispatcher) = &self.dispatcher {
            for event in events {
                dispatcher.publish(&snapshot, event);
            }
        }
        Ok(published)
    }

    /// Audit rows for one entity, visible to the caller's tenant only.
    pub fn audit_trail(
        &self,
        gateway: &TenantGateway,
        ctx: &SessionContext,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, GovernanceError> {
        let mut conn = gateway.acquire(Some(ctx))?;
        Ok(conn.read().audit_records_for(entity_type, entity_id)?)
    }

    pub fn redact(&self, value: Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(self.redact_map(map)),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.redact(v)).collect()),
            other => other,
        }
    }

    fn redact_map(&self, map: Map<String, Value>) -> Map<String, Value> {
        map.into_iter()
            .map(|(key, value)| {
                if self.is_sensitive(&key) && !value.is_null() {
                    (key, Value::String(REDACTED.into()))
                } else {
                    let value = self.redact(value);
                    (key, value)
                }
            })
            .collect()
    }
}

fn as_map(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other.clone());
            map
        }
    }
}

/// Changed attributes only. Creation has no `before`, deletion no `after`.
pub fn shallow_diff(
    before: Option<&Value>,
    after: Option<&Value>,
) -> (Option<Map<String, Value>>, Option<Map<String, Value>>) {
    match (before, after) {
        (None, None) => (None, None),
        (None, Some(after)) => (None, Some(as_map(after))),
        (Some(before), None) => (Some(as_map(before)), None),
        (Some(before), Some(after)) => {
            let before = as_map(before);
            let after = as_map(after);
            let mut old_values = Map::new();
            let mut new_values = Map::new();

            for (key, new_value) in &after {
                match before.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        old_values.insert(key.clone(), old_value.clone());
                        new_values.insert(key.clone(), new_value.clone());
                    }
                    None => {
                        new_values.insert(key.clone(), new_value.clone());
                    }
                }
            }
            for (key, old_value) in &before {
                if !after.contains_key(key) {
                    old_values.insert(key.clone(), old_value.clone());
                    new_values.insert(key.clone(), Value::Null);
                }
            }
            (Some(old_values), Some(new_values))
        }
    }
}
