//! Policy engine.
//!
//! Answers "may this subject perform `action` on `target`?" from an ordered
//! ruleset: the tenant's rules plus global ones, sorted by priority, then
//! creation time, then id. The first rule whose condition holds decides.
//! In-code baseline rules are consulted only after every stored rule.

pub mod cache;
pub mod condition;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::PolicyConfig;
use crate::core::error::GovernanceError;
use crate::core::gateway::UnitOfWork;
use crate::core::session::SessionContext;
use crate::core::store::StoreConnection;
use crate::security::audit::{AuditEntry, AuditRecorder};

pub use cache::{RuleCache, RuleScope};
pub use condition::Condition;

pub const ACTION_WILDCARD: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    Allow,
    Deny,
    Review,
}

impl Effect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Effect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allow" => Ok(Self::Allow),
            "deny" => Ok(Self::Deny),
            "review" | "require_review" => Ok(Self::Review),
            other => Err(format!("unknown effect '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: Uuid,
    #[serde(rename = "org_id", default, skip_serializing_if = "Option::is_none")]
    pub organization_id: Option<Uuid>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub target: String,
    pub action: String,
    pub effect: Effect,
    pub condition: Condition,
    pub priority: i32,
    pub enabled: bool,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PolicyRule {
    pub fn is_global(&self) -> bool {
        self.organization_id.is_none()
    }

    pub fn applies_to(&self, target: &str, action: &str) -> bool {
        self.enabled
            && self.target == target
            && (self.action == action || self.action == ACTION_WILDCARD)
    }
}

fn sort_rules(rules: &mut [PolicyRule]) {
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}

/// Everything a rule condition can look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRequest {
    pub target: String,
    pub action: String,
    pub subject: SessionContext,
    pub context: Map<String, Value>,
}

impl DecisionRequest {
    pub fn new(target: &str, action: &str, subject: &SessionContext) -> Self {
        Self {
            target: target.to_string(),
            action: action.to_string(),
            subject: subject.clone(),
            context: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context.extend(context);
        self
    }

    /// Context attributes at the top level plus `subject.*`, `target` and
    /// `action`. Context keys never shadow the subject.
    pub fn attribute_bag(&self) -> Map<String, Value> {
        let mut bag = self.context.clone();
        bag.insert(
            "subject".into(),
            json!({
                "org_id": self.subject.organization_id,
                "user_id": self.subject.user_id,
                "role": self.subject.role.as_str(),
            }),
        );
        bag.insert("target".into(), Value::String(self.target.clone()));
        bag.insert("action".into(), Value::String(self.action.clone()));
        bag
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub effect: Effect,
    pub rule_id: Option<Uuid>,
    pub rule_name: Option<String>,
    pub reason: String,
    pub target: String,
    pub action: String,
}

impl Decision {
    pub fn is_denied(&self) -> bool {
        self.effect == Effect::Deny
    }

    pub fn review_required(&self) -> bool {
        self.effect == Effect::Review
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "effect": self.effect.as_str() }))
    }
}

/// Editable fields of a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub target: String,
    pub action: String,
    pub effect: Effect,
    #[serde(default)]
    pub condition: Condition,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Applies to every tenant. Only the `system` role may write these.
    #[serde(default)]
    pub global: bool,
}

fn default_enabled() -> bool {
    true
}

impl RuleDraft {
    pub fn new(name: &str, target: &str, action: &str, effect: Effect) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            target: target.to_string(),
            action: action.to_string(),
            effect,
            condition: Condition::True,
            priority: 0,
            enabled: true,
            global: false,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn when(mut self, condition: Condition) -> Self {
        self.condition = condition;
        self
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    fn validate(&self) -> Result<(), GovernanceError> {
        if self.name.trim().is_empty() {
            return Err(GovernanceError::Validation("rule name is empty".into()));
        }
        if self.target.trim().is_empty() || self.action.trim().is_empty() {
            return Err(GovernanceError::Validation(
                "rule target and action are required".into(),
            ));
        }
        self.condition
            .validate()
            .map_err(|e| GovernanceError::Validation(format!("rule '{}': {e}", self.name)))
    }
}

pub struct PolicyEngine {
    cache: Arc<RuleCache>,
    deny_by_default: HashSet<String>,
    baseline: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(config: &PolicyConfig) -> Self {
        Self {
            cache: Arc::new(RuleCache::new(Duration::from_secs(config.cache_ttl_secs))),
            deny_by_default: config.deny_by_default.iter().cloned().collect(),
            baseline: Vec::new(),
        }
    }

    /// Rules consulted after every stored rule, for all tenants.
    pub fn with_baseline(mut self, mut rules: Vec<PolicyRule>) -> Self {
        sort_rules(&mut rules);
        self.baseline = rules;
        self
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    pub fn is_deny_by_default(&self, target: &str) -> bool {
        self.deny_by_default.contains(target)
    }

    /// Sorted ruleset visible to the connection's tenant.
    pub fn ruleset(
        &self,
        conn: &mut dyn StoreConnection,
        org: Uuid,
    ) -> Result<Arc<Vec<PolicyRule>>, GovernanceError> {
        if let Some(rules) = self.cache.get(org) {
            return Ok(rules);
        }
        let generation = self.cache.generation();
        let mut rules = conn.policy_rules()?;
        sort_rules(&mut rules);
        debug!(org_id = %org, rules = rules.len(), "Loaded policy ruleset");
        Ok(self.cache.store(org, rules, generation))
    }

    /// `conn` must be bound to the subject's tenant.
    pub fn evaluate(
        &self,
        conn: &mut dyn StoreConnection,
        request: &DecisionRequest,
    ) -> Result<Decision, GovernanceError> {
        let rules = self.ruleset(conn, request.subject.organization_id)?;
        let decision = self.decide(&rules, request);
        debug!(
            target = %request.target,
            action = %request.action,
            effect = %decision.effect,
            rule = decision.rule_name.as_deref().unwrap_or("-"),
            "Policy decision"
        );
        Ok(decision)
    }

    /// Like `evaluate`, but a deny becomes `PolicyDeny`.
    pub fn enforce(
        &self,
        conn: &mut dyn StoreConnection,
        request: &DecisionRequest,
    ) -> Result<Decision, GovernanceError> {
        let decision = self.evaluate(conn, request)?;
        if decision.is_denied() {
            warn!(
                org_id = %request.subject.organization_id,
                user_id = %request.subject.user_id,
                target = %request.target,
                action = %request.action,
                "Policy denied action"
            );
            return Err(GovernanceError::PolicyDeny {
                rule: decision
                    .rule_name
                    .clone()
                    .unwrap_or_else(|| "default-deny".to_string()),
                reason: decision.reason.clone(),
            });
        }
        Ok(decision)
    }

    /// Pure evaluation over an already sorted ruleset.
    pub fn decide(&self, rules: &[PolicyRule], request: &DecisionRequest) -> Decision {
        let bag = request.attribute_bag();
        let matched = rules
            .iter()
            .chain(self.baseline.iter())
            .filter(|rule| rule.applies_to(&request.target, &request.action))
            .find(|rule| rule.condition.evaluate(&bag));

        match matched {
            Some(rule) => Decision {
                effect: rule.effect,
                rule_id: Some(rule.id),
                rule_name: Some(rule.name.clone()),
                reason: format!("matched rule '{}' ({})", rule.name, rule.condition),
                target: request.target.clone(),
                action: request.action.clone(),
            },
            None if self.is_deny_by_default(&request.target) => Decision {
                effect: Effect::Deny,
                rule_id: None,
                rule_name: None,
                reason: format!("no rule matched and '{}' denies by default", request.target),
                target: request.target.clone(),
                action: request.action.clone(),
            },
            None => Decision {
                effect: Effect::Allow,
                rule_id: None,
                rule_name: None,
                reason: "no rule matched".into(),
                target: request.target.clone(),
                action: request.action.clone(),
            },
        }
    }

    /// Keeps `scope` out of the cache until `uow` commits or rolls back.
    fn track_change(&self, uow: &mut UnitOfWork, scope: RuleScope) {
        self.cache.begin_change(scope);
        let cache = Arc::clone(&self.cache);
        uow.on_finish(move |committed| {
            cache.end_change(scope);
            debug!(?scope, committed, "Policy rule change settled");
        });
    }

    pub fn create_rule(
        &self,
        uow: &mut UnitOfWork,
        audit: &AuditRecorder,
        draft: RuleDraft,
    ) -> Result<PolicyRule, GovernanceError> {
        draft.validate()?;
        let session = uow.session().clone();
        let now = Utc::now();
        let rule = PolicyRule {
            id: Uuid::new_v4(),
            organization_id: (!draft.global).then_some(session.organization_id),
            name: draft.name,
            description: draft.description,
            target: draft.target,
            action: draft.action,
            effect: draft.effect,
            condition: draft.condition,
            priority: draft.priority,
            enabled: draft.enabled,
            created_by: Some(session.user_id),
            created_at: now,
            updated_at: now,
        };

        self.track_change(uow, RuleScope::of(rule.organization_id));
        uow.write()?.insert_policy_rule(&rule)?;
        audit.record(
            uow,
            AuditEntry::created("policy_rule", &rule.id.to_string(), rule_snapshot(&rule)),
        )?;
        info!(rule_id = %rule.id, name = %rule.name, global = rule.is_global(), "Policy rule created");
        Ok(rule)
    }

    pub fn update_rule(
        &self,
        uow: &mut UnitOfWork,
        audit: &AuditRecorder,
        id: Uuid,
        draft: RuleDraft,
    ) -> Result<PolicyRule, GovernanceError> {
        draft.validate()?;
        let existing = uow
            .read()
            .policy_rule(id)?
            .ok_or_else(|| GovernanceError::NotFound(format!("policy rule {id}")))?;

        let updated = PolicyRule {
            name: draft.name,
            description: draft.description,
            target: draft.target,
            action: draft.action,
            effect: draft.effect,
            condition: draft.condition,
            priority: draft.priority,
            enabled: draft.enabled,
            updated_at: Utc::now(),
            ..existing.clone()
        };

        self.track_change(uow, RuleScope::of(existing.organization_id));
        if !uow.write()?.update_policy_rule(&updated)? {
            return Err(GovernanceError::NotFound(format!("policy rule {id}")));
        }
        audit.record(
            uow,
            AuditEntry::updated(
                "policy_rule",
                &id.to_string(),
                rule_snapshot(&existing),
                rule_snapshot(&updated),
            ),
        )?;
        info!(rule_id = %id, "Policy rule updated");
        Ok(updated)
    }

    pub fn delete_rule(
        &self,
        uow: &mut UnitOfWork,
        audit: &AuditRecorder,
        id: Uuid,
    ) -> Result<(), GovernanceError> {
        let existing = uow
            .read()
            .policy_rule(id)?
            .ok_or_else(|| GovernanceError::NotFound(format!("policy rule {id}")))?;

        self.track_change(uow, RuleScope::of(existing.organization_id));
        if !uow.write()?.delete_policy_rule(id)? {
            return Err(GovernanceError::NotFound(format!("policy rule {id}")));
        }
        audit.record(
            uow,
            AuditEntry::deleted("policy_rule", &id.to_string(), rule_snapshot(&existing)),
        )?;
        info!(rule_id = %id, "Policy rule deleted");
        Ok(())
    }
}

fn rule_snapshot(rule: &PolicyRule) -> Value {
    serde_json::to_value(rule).unwrap_or(Value::Null)
}
