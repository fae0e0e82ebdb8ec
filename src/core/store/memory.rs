//! In-process store with the same visibility and write rules the Postgres
//! policies enforce. Used by `backend = "memory"` and by the test suite.
//!
//! Transactions buffer their mutations and apply them on commit. Reads inside
//! a transaction see committed rows plus the transaction's own writes.
//! Updates to a webhook row hold that row until the transaction ends, as an
//! `UPDATE` does in Postgres.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{
    write_roles, AuditLog, LedgerStore, PolicyRuleStore, SchemaInspector, SessionParams,
    StoreError, TicketStore, WebhookStore,
};
use crate::core::session::{Role, PARAM_CURRENT_ORG, PARAM_CURRENT_ROLE};
use crate::core::shared::models::{
    AiProvenance, AiSecurityEvent, AuditRecord, CopilotRun, RunCompletion, RunStatus,
    TableRlsStatus, Ticket, Webhook, WebhookDelivery,
};
use crate::security::policy::PolicyRule;

const POLICIES_PER_TABLE: i64 = 2;
const ROW_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
struct Tables {
    tickets: Vec<Ticket>,
    audit_records: Vec<AuditRecord>,
    policy_rules: Vec<PolicyRule>,
    ai_provenance: Vec<AiProvenance>,
    ai_security_events: Vec<AiSecurityEvent>,
    copilot_runs: Vec<CopilotRun>,
    webhooks: Vec<Webhook>,
    webhook_deliveries: Vec<WebhookDelivery>,
}

#[derive(Debug, Default)]
struct Shared {
    tables: Tables,
    rls_disabled: HashSet<String>,
    failing_tables: HashSet<String>,
    fail_next_commit: bool,
    /// Row id to the connection whose open transaction holds it.
    row_locks: HashMap<Uuid, u64>,
    next_connection: u64,
}

/// Handle to one in-process database. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Mutex<Shared>>,
    row_released: Arc<Condvar>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self) -> MemoryConnection {
        let id = {
            let mut shared = self.lock();
            shared.next_connection += 1;
            shared.next_connection
        };
        MemoryConnection {
            id,
            db: self.clone(),
            params: HashMap::new(),
            pending: None,
            broken: false,
        }
    }

    /// Makes the next commit on any connection fail and roll back.
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }

    /// Makes every write to `table` fail until restored.
    pub fn fail_writes_to(&self, table: &str) {
        self.lock().failing_tables.insert(table.to_string());
    }

    pub fn restore_writes_to(&self, table: &str) {
        self.lock().failing_tables.remove(table);
    }

    /// Turns off the row filter for `table`, as if its policies were never
    /// installed.
    pub fn disable_row_security(&self, table: &str) {
        self.lock().rls_disabled.insert(table.to_string());
    }

    /// Committed row count, ignoring every row filter.
    pub fn row_count(&self, table: &str) -> usize {
        let shared = self.lock();
        let t = &shared.tables;
        match table {
            "tickets" => t.tickets.len(),
            "audit_records" => t.audit_records.len(),
            "policy_rules" => t.policy_rules.len(),
            "ai_provenance" => t.ai_provenance.len(),
            "ai_security_events" => t.ai_security_events.len(),
            "copilot_runs" => t.copilot_runs.len(),
            "webhooks" => t.webhooks.len(),
            "webhook_deliveries" => t.webhook_deliveries.len(),
            _ => 0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Mutation = Box<dyn Fn(&mut Tables) + Send>;

/// Which rows of one table the current session may read.
struct RowFilter {
    bypass: bool,
    org: Option<Uuid>,
    include_global: bool,
}

impl RowFilter {
    fn admits(&self, row_org: Option<Uuid>) -> bool {
        if self.bypass {
            return true;
        }
        match (self.org, row_org) {
            (Some(org), Some(row)) => org == row,
            (Some(_), None) => self.include_global,
            (None, _) => false,
        }
    }
}

pub struct MemoryConnection {
    id: u64,
    db: MemoryDatabase,
    params: HashMap<String, String>,
    pending: Option<Vec<Mutation>>,
    broken: bool,
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("params", &self.params)
            .field("in_transaction", &self.pending.is_some())
            .field("broken", &self.broken)
            .finish()
    }
}

impl MemoryConnection {
    fn current_org(&self) -> Option<Uuid> {
        self.params
            .get(PARAM_CURRENT_ORG)
            .and_then(|v| Uuid::parse_str(v).ok())
    }

    fn current_role(&self) -> Option<Role> {
        self.params
            .get(PARAM_CURRENT_ROLE)
            .and_then(|v| v.parse::<Role>().ok())
    }

    fn read_filter(&self, table: &str) -> RowFilter {
        RowFilter {
            bypass: self.db.lock().rls_disabled.contains(table),
            org: self.current_org(),
            include_global: table == "policy_rules",
        }
    }

    fn check_write(&self, table: &str, row_org: Option<Uuid>) -> Result<(), StoreError> {
        {
            let shared = self.db.lock();
            if shared.failing_tables.contains(table) {
                return Err(StoreError::Query(format!("write to {table} failed")));
            }
            if shared.rls_disabled.contains(table) {
                return Ok(());
            }
        }

        let role = self.current_role();
        let role_allowed = role.is_some_and(|r| write_roles(table).contains(&r));
        let org_allowed = match (self.current_org(), row_org) {
            (Some(org), Some(row)) => org == row,
            (Some(_), None) => role == Some(Role::System),
            (None, _) => false,
        };

        if role_allowed && org_allowed {
            Ok(())
        } else {
            Err(StoreError::PolicyViolation {
                table: table.to_string(),
            })
        }
    }

    /// Committed rows plus this connection's uncommitted writes.
    fn view(&self) -> Tables {
        let mut tables = self.db.lock().tables.clone();
        if let Some(pending) = &self.pending {
            for mutation in pending {
                mutation(&mut tables);
            }
        }
        tables
    }

    fn apply(&mut self, mutation: Mutation) {
        match self.pending.as_mut() {
            Some(pending) => pending.push(mutation),
            None => mutation(&mut self.db.lock().tables),
        }
    }

    /// Waits until no other open transaction holds `row`, then holds it
    /// until this one ends. Outside a transaction there is nothing to hold.
    fn lock_row(&self, row: Uuid) -> Result<(), StoreError> {
        if self.pending.is_none() {
            return Ok(());
        }
        let deadline = Instant::now() + ROW_LOCK_TIMEOUT;
        let mut shared = self.db.lock();
        loop {
            match shared.row_locks.get(&row).copied() {
                None => {
                    shared.row_locks.insert(row, self.id);
                    return Ok(());
                }
                Some(owner) if owner == self.id => return Ok(()),
                Some(_) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(StoreError::Query(format!(
                            "canceling statement due to lock timeout on row {row}"
                        )));
                    }
                    shared = self
                        .db
                        .row_released
                        .wait_timeout(shared, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
    }

    fn release_rows(&self) {
        let mut shared = self.db.lock();
        let held = shared.row_locks.len();
        shared.row_locks.retain(|_, owner| *owner != self.id);
        if shared.row_locks.len() != held {
            self.db.row_released.notify_all();
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release_rows();
    }
}

/// Increments the hook's failure counter and returns the stored value.
fn bump_failure(t: &mut Tables, id: Uuid, reason: &str, at: DateTime<Utc>) -> Option<i32> {
    let w = t.webhooks.iter_mut().find(|w| w.id == id)?;
    w.failure_count += 1;
    w.last_failure_reason = Some(reason.to_string());
    w.last_triggered_at = Some(at);
    w.updated_at = at;
    Some(w.failure_count)
}

fn duplicate_key(table: &str) -> StoreError {
    StoreError::Query(format!(
        "duplicate key value violates unique constraint \"{table}_pkey\""
    ))
}

impl SessionParams for MemoryConnection {
    fn set_parameter(&mut self, name: &str, value: Option<&str>) -> Result<(), StoreError> {
        if self.broken {
            return Err(StoreError::Connection("connection is broken".into()));
        }
        match value {
            Some(v) => self.params.insert(name.to_string(), v.to_string()),
            None => self.params.remove(name),
        };
        Ok(())
    }

    fn parameter(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.params.get(name).cloned())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        if self.pending.is_some() {
            return Err(StoreError::Transaction("transaction already open".into()));
        }
        self.pending = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| StoreError::Transaction("no transaction open".into()))?;
        let result = {
            let mut shared = self.db.lock();
            if shared.fail_next_commit {
                shared.fail_next_commit = false;
                Err(StoreError::Transaction(
                    "could not commit transaction".into(),
                ))
            } else {
                for mutation in pending {
                    mutation(&mut shared.tables);
                }
                Ok(())
            }
        };
        self.release_rows();
        result
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending = None;
        self.release_rows();
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.pending.is_some()
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        if self.broken {
            Err(StoreError::Connection("connection is broken".into()))
        } else {
            Ok(())
        }
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl AuditLog for MemoryConnection {
    fn insert_audit_record(&mut self, record: &AuditRecord) -> Result<(), StoreError> {
        self.check_write("audit_records", Some(record.organization_id))?;
        if self.view().audit_records.iter().any(|r| r.id == record.id) {
            return Err(duplicate_key("audit_records"));
        }
        let record = record.clone();
        self.apply(Box::new(move |t| t.audit_records.push(record.clone())));
        Ok(())
    }

    fn audit_records_for(
        &mut self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let filter = self.read_filter("audit_records");
        Ok(self
            .view()
            .audit_records
            .into_iter()
            .filter(|r| filter.admits(Some(r.organization_id)))
            .filter(|r| r.entity_type == entity_type && r.entity_id == entity_id)
            .collect())
    }
}

impl LedgerStore for MemoryConnection {
    fn insert_provenance(&mut self, record: &AiProvenance) -> Result<(), StoreError> {
        self.check_write("ai_provenance", Some(record.organization_id))?;
        if self.view().ai_provenance.iter().any(|r| r.id == record.id) {
            return Err(duplicate_key("ai_provenance"));
        }
        let record = record.clone();
        self.apply(Box::new(move |t| t.ai_provenance.push(record.clone())));
        Ok(())
    }

    fn provenance_records(
        &mut self,
        ticket_id: Option<Uuid>,
    ) -> Result<Vec<AiProvenance>, StoreError> {
        let filter = self.read_filter("ai_provenance");
        Ok(self
            .view()
            .ai_provenance
            .into_iter()
            .filter(|r| filter.admits(Some(r.organization_id)))
            .filter(|r| ticket_id.is_none() || r.ticket_id == ticket_id)
            .collect())
    }

    fn insert_security_event(&mut self, event: &AiSecurityEvent) -> Result<(), StoreError> {
        self.check_write("ai_security_events", Some(event.organization_id))?;
        let event = event.clone();
        self.apply(Box::new(move |t| t.ai_security_events.push(event.clone())));
        Ok(())
    }

    fn security_events(&mut self) -> Result<Vec<AiSecurityEvent>, StoreError> {
        let filter = self.read_filter("ai_security_events");
        Ok(self
            .view()
            .ai_security_events
            .into_iter()
            .filter(|e| filter.admits(Some(e.organization_id)))
            .collect())
    }

    fn insert_copilot_run(&mut self, run: &CopilotRun) -> Result<(), StoreError> {
        self.check_write("copilot_runs", Some(run.organization_id))?;
        if self.view().copilot_runs.iter().any(|r| r.id == run.id) {
            return Err(duplicate_key("copilot_runs"));
        }
        let run = run.clone();
        self.apply(Box::new(move |t| t.copilot_runs.push(run.clone())));
        Ok(())
    }

    fn copilot_run(&mut self, id: Uuid) -> Result<Option<CopilotRun>, StoreError> {
        let filter = self.read_filter("copilot_runs");
        Ok(self
            .view()
            .copilot_runs
            .into_iter()
            .find(|r| r.id == id && filter.admits(Some(r.organization_id))))
    }

    fn copilot_runs(&mut self, ticket_id: Option<Uuid>) -> Result<Vec<CopilotRun>, StoreError> {
        let filter = self.read_filter("copilot_runs");
        Ok(self
            .view()
            .copilot_runs
            .into_iter()
            .filter(|r| filter.admits(Some(r.organization_id)))
            .filter(|r| ticket_id.is_none() || r.ticket_id == ticket_id)
            .collect())
    }

    fn finish_copilot_run(
        &mut self,
        id: Uuid,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        let Some(run) = self.copilot_run(id)? else {
            return Ok(false);
        };
        if run.status.is_terminal() {
            return Ok(false);
        }
        self.check_write("copilot_runs", Some(run.organization_id))?;

        let completion = completion.clone();
        self.apply(Box::new(move |t| {
            if let Some(run) = t
                .copilot_runs
                .iter_mut()
                .find(|r| r.id == id && r.status == RunStatus::Pending)
            {
                run.status = completion.status;
                run.plan = completion.plan.clone();
                run.tool_trace = completion.tool_trace.clone();
                run.output = completion.output.clone();
                run.latency_ms = Some(completion.latency_ms);
                run.error = completion.error.clone();
                run.completed_at = Some(completion.completed_at);
            }
        }));
        Ok(true)
    }
}

impl PolicyRuleStore for MemoryConnection {
    fn policy_rules(&mut self) -> Result<Vec<PolicyRule>, StoreError> {
        let filter = self.read_filter("policy_rules");
        Ok(self
            .view()
            .policy_rules
            .into_iter()
            .filter(|r| filter.admits(r.organization_id))
            .collect())
    }

    fn policy_rule(&mut self, id: Uuid) -> Result<Option<PolicyRule>, StoreError> {
        Ok(self.policy_rules()?.into_iter().find(|r| r.id == id))
    }

    fn insert_policy_rule(&mut self, rule: &PolicyRule) -> Result<(), StoreError> {
        self.check_write("policy_rules", rule.organization_id)?;
        if self.view().policy_rules.iter().any(|r| r.id == rule.id) {
            return Err(duplicate_key("policy_rules"));
        }
        let rule = rule.clone();
        self.apply(Box::new(move |t| t.policy_rules.push(rule.clone())));
        Ok(())
    }

    fn update_policy_rule(&mut self, rule: &PolicyRule) -> Result<bool, StoreError> {
        let Some(existing) = self.policy_rule(rule.id)? else {
            return Ok(false);
        };
        self.check_write("policy_rules", existing.organization_id)?;
        self.check_write("policy_rules", rule.organization_id)?;

        let rule = rule.clone();
        self.apply(Box::new(move |t| {
            if let Some(slot) = t.policy_rules.iter_mut().find(|r| r.id == rule.id) {
                *slot = rule.clone();
            }
        }));
        Ok(true)
    }

    fn delete_policy_rule(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let Some(existing) = self.policy_rule(id)? else {
            return Ok(false);
        };
        self.check_write("policy_rules", existing.organization_id)?;
        self.apply(Box::new(move |t| t.policy_rules.retain(|r| r.id != id)));
        Ok(true)
    }
}

impl WebhookStore for MemoryConnection {
    fn webhooks_for_event(&mut self, event: &str) -> Result<Vec<Webhook>, StoreError> {
        let filter = self.read_filter("webhooks");
        Ok(self
            .view()
            .webhooks
            .into_iter()
            .filter(|w| filter.admits(Some(w.organization_id)))
            .filter(|w| w.enabled && w.subscribes_to(event))
            .collect())
    }

    fn webhook(&mut self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
        let filter = self.read_filter("webhooks");
        Ok(self
            .view()
            .webhooks
            .into_iter()
            .find(|w| w.id == id && filter.admits(Some(w.organization_id))))
    }

    fn insert_webhook(&mut self, webhook: &Webhook) -> Result<(), StoreError> {
        self.check_write("webhooks", Some(webhook.organization_id))?;
        if self.view().webhooks.iter().any(|w| w.id == webhook.id) {
            return Err(duplicate_key("webhooks"));
        }
        let webhook = webhook.clone();
        self.apply(Box::new(move |t| t.webhooks.push(webhook.clone())));
        Ok(())
    }

    fn record_webhook_success(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(hook) = self.webhook(id)? else {
            return Ok(());
        };
        self.check_write("webhooks", Some(hook.organization_id))?;
        self.lock_row(id)?;
        self.apply(Box::new(move |t| {
            if let Some(w) = t.webhooks.iter_mut().find(|w| w.id == id) {
                w.failure_count = 0;
                w.last_triggered_at = Some(at);
                w.updated_at = at;
            }
        }));
        Ok(())
    }

    fn record_webhook_failure(
        &mut self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        let hook = self
            .webhook(id)?
            .ok_or_else(|| StoreError::Query(format!("webhook {id} not found")))?;
        self.check_write("webhooks", Some(hook.organization_id))?;
        let missing = || StoreError::Query(format!("webhook {id} not found"));

        if self.pending.is_none() {
            return bump_failure(&mut self.db.lock().tables, id, reason, at).ok_or_else(missing);
        }
        self.lock_row(id)?;
        let reason = reason.to_string();
        self.apply(Box::new(move |t| {
            bump_failure(t, id, &reason, at);
        }));
        // The row lock keeps the committed count current until commit.
        self.webhook(id)?.map(|w| w.failure_count).ok_or_else(missing)
    }

    fn disable_webhook(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let Some(hook) = self.webhook(id)? else {
            return Ok(());
        };
        self.check_write("webhooks", Some(hook.organization_id))?;
        self.lock_row(id)?;
        self.apply(Box::new(move |t| {
            if let Some(w) = t.webhooks.iter_mut().find(|w| w.id == id) {
                w.enabled = false;
                w.updated_at = at;
            }
        }));
        Ok(())
    }

    fn insert_webhook_delivery(&mut self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        self.check_write("webhook_deliveries", Some(delivery.organization_id))?;
        let delivery = delivery.clone();
        self.apply(Box::new(move |t| t.webhook_deliveries.push(delivery.clone())));
        Ok(())
    }

    fn webhook_deliveries(&mut self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>, StoreError> {
        let filter = self.read_filter("webhook_deliveries");
        Ok(self
            .view()
            .webhook_deliveries
            .into_iter()
            .filter(|d| d.webhook_id == webhook_id && filter.admits(Some(d.organization_id)))
            .collect())
    }
}

impl TicketStore for MemoryConnection {
    fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError> {
        self.check_write("tickets", Some(ticket.organization_id))?;
        if self.view().tickets.iter().any(|t| t.id == ticket.id) {
            return Err(duplicate_key("tickets"));
        }
        let ticket = ticket.clone();
        self.apply(Box::new(move |t| t.tickets.push(ticket.clone())));
        Ok(())
    }

    fn tickets(&mut self) -> Result<Vec<Ticket>, StoreError> {
        let filter = self.read_filter("tickets");
        Ok(self
            .view()
            .tickets
            .into_iter()
            .filter(|t| filter.admits(Some(t.organization_id)))
            .collect())
    }

    fn ticket(&mut self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tickets()?.into_iter().find(|t| t.id == id))
    }

    fn update_ticket(&mut self, ticket: &Ticket) -> Result<bool, StoreError> {
        let Some(existing) = self.ticket(ticket.id)? else {
            return Ok(false);
        };
        self.check_write("tickets", Some(existing.organization_id))?;
        self.check_write("tickets", Some(ticket.organization_id))?;

        let ticket = ticket.clone();
        self.apply(Box::new(move |t| {
            if let Some(slot) = t.tickets.iter_mut().find(|row| row.id == ticket.id) {
                *slot = ticket.clone();
            }
        }));
        Ok(true)
    }
}

impl SchemaInspector for MemoryConnection {
    fn rls_status(&mut self, tables: &[&str]) -> Result<Vec<TableRlsStatus>, StoreError> {
        let shared = self.db.lock();
        Ok(tables
            .iter()
            .map(|table| {
                let active = !shared.rls_disabled.contains(*table);
                TableRlsStatus {
                    table: (*table).to_string(),
                    rls_enabled: active,
                    rls_forced: active,
                    policy_count: if active { POLICIES_PER_TABLE } else { 0 },
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::SessionContext;

    fn bind(conn: &mut MemoryConnection, ctx: &SessionContext) {
        for (name, value) in ctx.parameters() {
            conn.set_parameter(name, Some(&value)).expect("set parameter");
        }
    }

    fn ticket(org: Uuid, subject: &str) -> Ticket {
        let now = Utc::now();
        Ticket {
            id: Uuid::new_v4(),
            organization_id: org,
            subject: subject.to_string(),
            description: None,
            status: "open".into(),
            priority: "normal".into(),
            requester_id: None,
            assignee_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_reads_are_tenant_filtered() {
        let db = MemoryDatabase::new();
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();

        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(org_a, Uuid::new_v4(), Role::Agent));
        conn.insert_ticket(&ticket(org_a, "a")).expect("insert a");
        bind(&mut conn, &SessionContext::new(org_b, Uuid::new_v4(), Role::Agent));
        conn.insert_ticket(&ticket(org_b, "b")).expect("insert b");

        let visible = conn.tickets().expect("list");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].organization_id, org_b);

        let mut bare = db.connect();
        assert!(bare.tickets().expect("list").is_empty());
        assert_eq!(db.row_count("tickets"), 2);
    }

    #[test]
    fn test_write_for_other_tenant_rejected() {
        let db = MemoryDatabase::new();
        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent));
        let err = conn
            .insert_ticket(&ticket(Uuid::new_v4(), "foreign"))
            .expect_err("must be rejected");
        assert!(matches!(err, StoreError::PolicyViolation { .. }));
    }

    #[test]
    fn test_write_role_enforced() {
        let db = MemoryDatabase::new();
        let org = Uuid::new_v4();
        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(org, Uuid::new_v4(), Role::Agent));
        let now = Utc::now();
        let hook = Webhook {
            id: Uuid::new_v4(),
            organization_id: org,
            url: "https://hooks.example.com".into(),
            secret: "whsec_x".into(),
            event_types: vec!["ticket.created".into()],
            enabled: true,
            failure_count: 0,
            last_triggered_at: None,
            last_failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        assert!(conn.insert_webhook(&hook).is_err());

        bind(&mut conn, &SessionContext::new(org, Uuid::new_v4(), Role::Admin));
        conn.insert_webhook(&hook).expect("admin may register");
    }

    #[test]
    fn test_rollback_discards_writes() {
        let db = MemoryDatabase::new();
        let org = Uuid::new_v4();
        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(org, Uuid::new_v4(), Role::Agent));

        conn.begin().expect("begin");
        conn.insert_ticket(&ticket(org, "draft")).expect("insert");
        assert_eq!(conn.tickets().expect("list").len(), 1);
        assert_eq!(db.row_count("tickets"), 0);
        conn.rollback().expect("rollback");

        assert!(conn.tickets().expect("list").is_empty());
    }

    #[test]
    fn test_injected_commit_failure() {
        let db = MemoryDatabase::new();
        let org = Uuid::new_v4();
        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(org, Uuid::new_v4(), Role::Agent));

        db.fail_next_commit();
        conn.begin().expect("begin");
        conn.insert_ticket(&ticket(org, "lost")).expect("insert");
        assert!(conn.commit().is_err());
        assert!(!conn.in_transaction());
        assert_eq!(db.row_count("tickets"), 0);

        conn.begin().expect("begin");
        conn.insert_ticket(&ticket(org, "kept")).expect("insert");
        conn.commit().expect("second commit succeeds");
        assert_eq!(db.row_count("tickets"), 1);
    }

    fn seed_hook(db: &MemoryDatabase, org: Uuid) -> Uuid {
        let now = Utc::now();
        let hook = Webhook {
            id: Uuid::new_v4(),
            organization_id: org,
            url: "https://hooks.example.com".into(),
            secret: "whsec_x".into(),
            event_types: vec!["ticket.created".into()],
            enabled: true,
            failure_count: 0,
            last_triggered_at: None,
            last_failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(org, Uuid::new_v4(), Role::Admin));
        conn.insert_webhook(&hook).expect("insert");
        hook.id
    }

    fn bookkeeper(db: &MemoryDatabase, org: Uuid) -> MemoryConnection {
        let mut conn = db.connect();
        bind(&mut conn, &SessionContext::new(org, Uuid::new_v4(), Role::System));
        conn
    }

    #[test]
    fn test_concurrent_failures_report_distinct_counts() {
        let db = MemoryDatabase::new();
        let org = Uuid::new_v4();
        let id = seed_hook(&db, org);

        let mut first = bookkeeper(&db, org);
        first.begin().expect("begin");
        assert_eq!(first.record_webhook_failure(id, "HTTP 500", Utc::now()).expect("failure"), 1);

        let second_db = db.clone();
        let second = std::thread::spawn(move || {
            let mut conn = bookkeeper(&second_db, org);
            conn.begin().expect("begin");
            let count = conn
                .record_webhook_failure(id, "HTTP 502", Utc::now())
                .expect("failure");
            conn.commit().expect("commit");
            count
        });
        std::thread::sleep(Duration::from_millis(50));
        first.commit().expect("commit");

        assert_eq!(second.join().expect("join"), 2);
        let mut reader = bookkeeper(&db, org);
        assert_eq!(reader.webhook(id).expect("read").expect("hook").failure_count, 2);
    }

    #[test]
    fn test_rolled_back_failure_releases_row() {
        let db = MemoryDatabase::new();
        let org = Uuid::new_v4();
        let id = seed_hook(&db, org);

        let mut first = bookkeeper(&db, org);
        first.begin().expect("begin");
        first.record_webhook_failure(id, "HTTP 500", Utc::now()).expect("failure");
        first.rollback().expect("rollback");

        let mut second = bookkeeper(&db, org);
        second.begin().expect("begin");
        assert_eq!(second.record_webhook_failure(id, "HTTP 500", Utc::now()).expect("failure"), 1);
        second.commit().expect("commit");
    }

    #[test]
    fn test_disabled_row_security_reported() {
        let db = MemoryDatabase::new();
        db.disable_row_security("webhooks");
        let mut conn = db.connect();
        let status = conn.rls_status(&["tickets", "webhooks"]).expect("status");
        assert!(status[0].is_protected());
        assert!(!status[1].is_protected());
    }
}
