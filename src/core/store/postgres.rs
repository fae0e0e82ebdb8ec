//! Postgres backend. Tenant filtering and write roles are enforced by the
//! row-level security policies in `migrations/`; this module only sets the
//! runtime parameters those policies read.

use chrono::{DateTime, Utc};
use diesel::connection::{AnsiTransactionManager, TransactionManager};
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{Array, BigInt, Bool, Nullable, Text, Uuid as SqlUuid};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    AuditLog, LedgerStore, PolicyRuleStore, SchemaInspector, SessionParams, StoreError,
    TicketStore, WebhookStore,
};
use crate::core::shared::models::{
    AiProvenance, AiSecurityEvent, AuditRecord, CopilotRun, RunCompletion, TableRlsStatus, Ticket,
    Webhook, WebhookDelivery,
};
use crate::core::shared::schema::{
    ai_provenance, ai_security_events, audit_records, copilot_runs, policy_rules, tickets,
    webhook_deliveries, webhooks,
};
use crate::security::policy::PolicyRule;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

const RLS_STATUS_SQL: &str = "\
SELECT c.relname::text AS table_name, \
       c.relrowsecurity AS rls_enabled, \
       c.relforcerowsecurity AS rls_forced, \
       (SELECT count(*) FROM pg_policies p \
         WHERE p.schemaname = n.nspname AND p.tablename = c.relname) AS policy_count \
FROM pg_class c \
JOIN pg_namespace n ON n.oid = c.relnamespace \
WHERE n.nspname = current_schema() \
  AND c.relkind = 'r' \
  AND c.relname::text = ANY($1)";

pub fn run_migrations(url: &str) -> Result<(), StoreError> {
    let mut conn = PgConnection::establish(url)?;
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migration(e.to_string()))?;
    info!(count = applied.len(), "Applied pending migrations");
    Ok(())
}

#[derive(QueryableByName)]
struct SettingValue {
    #[diesel(sql_type = Nullable<Text>)]
    value: Option<String>,
}

#[derive(QueryableByName)]
struct RlsRow {
    #[diesel(sql_type = Text)]
    table_name: String,
    #[diesel(sql_type = Bool)]
    rls_enabled: bool,
    #[diesel(sql_type = Bool)]
    rls_forced: bool,
    #[diesel(sql_type = BigInt)]
    policy_count: i64,
}

#[derive(Queryable, Insertable, AsChangeset)]
#[diesel(table_name = policy_rules)]
#[diesel(treat_none_as_null = true)]
struct PolicyRuleRow {
    id: Uuid,
    organization_id: Option<Uuid>,
    name: String,
    description: Option<String>,
    target: String,
    action: String,
    effect: String,
    condition: Value,
    priority: i32,
    enabled: bool,
    created_by: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<&PolicyRule> for PolicyRuleRow {
    type Error = StoreError;

    fn try_from(rule: &PolicyRule) -> Result<Self, Self::Error> {
        Ok(Self {
            id: rule.id,
            organization_id: rule.organization_id,
            name: rule.name.clone(),
            description: rule.description.clone(),
            target: rule.target.clone(),
            action: rule.action.clone(),
            effect: rule.effect.as_str().to_string(),
            condition: serde_json::to_value(&rule.condition)
                .map_err(|e| StoreError::Query(e.to_string()))?,
            priority: rule.priority,
            enabled: rule.enabled,
            created_by: rule.created_by,
            created_at: rule.created_at,
            updated_at: rule.updated_at,
        })
    }
}

impl TryFrom<PolicyRuleRow> for PolicyRule {
    type Error = StoreError;

    fn try_from(row: PolicyRuleRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            description: row.description,
            target: row.target,
            action: row.action,
            effect: row.effect.parse().map_err(StoreError::Query)?,
            condition: serde_json::from_value(row.condition)
                .map_err(|e| StoreError::Query(format!("rule {}: {e}", row.id)))?,
            priority: row.priority,
            enabled: row.enabled,
            created_by: row.created_by,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Queryable, Insertable)]
#[diesel(table_name = copilot_runs)]
struct CopilotRunRow {
    id: Uuid,
    organization_id: Uuid,
    ticket_id: Option<Uuid>,
    user_id: Uuid,
    plan: Option<Value>,
    tool_trace: Value,
    output: Option<String>,
    model_id: String,
    latency_ms: Option<i64>,
    status: String,
    error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<&CopilotRun> for CopilotRunRow {
    fn from(run: &CopilotRun) -> Self {
        Self {
            id: run.id,
            organization_id: run.organization_id,
            ticket_id: run.ticket_id,
            user_id: run.user_id,
            plan: run.plan.clone(),
            tool_trace: run.tool_trace.clone(),
            output: run.output.clone(),
            model_id: run.model_id.clone(),
            latency_ms: run.latency_ms,
            status: run.status.as_str().to_string(),
            error: run.error.clone(),
            created_at: run.created_at,
            completed_at: run.completed_at,
        }
    }
}

impl TryFrom<CopilotRunRow> for CopilotRun {
    type Error = StoreError;

    fn try_from(row: CopilotRunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            organization_id: row.organization_id,
            ticket_id: row.ticket_id,
            user_id: row.user_id,
            plan: row.plan,
            tool_trace: row.tool_trace,
            output: row.output,
            model_id: row.model_id,
            latency_ms: row.latency_ms,
            status: row.status.parse().map_err(StoreError::Query)?,
            error: row.error,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

pub struct PgStore {
    conn: PgConnection,
    in_transaction: bool,
    broken: bool,
}

impl PgStore {
    pub fn establish(url: &str) -> Result<Self, StoreError> {
        Ok(Self {
            conn: PgConnection::establish(url)?,
            in_transaction: false,
            broken: false,
        })
    }
}

impl SessionParams for PgStore {
    fn set_parameter(&mut self, name: &str, value: Option<&str>) -> Result<(), StoreError> {
        sql_query("SELECT set_config($1, $2, false) AS value")
            .bind::<Text, _>(name)
            .bind::<Text, _>(value.unwrap_or(""))
            .get_result::<SettingValue>(&mut self.conn)?;
        Ok(())
    }

    fn parameter(&mut self, name: &str) -> Result<Option<String>, StoreError> {
        let row = sql_query("SELECT current_setting($1, true) AS value")
            .bind::<Text, _>(name)
            .get_result::<SettingValue>(&mut self.conn)?;
        Ok(row.value.filter(|v| !v.is_empty()))
    }

    fn set_app_org(&mut self, org: Uuid) -> Result<(), StoreError> {
        sql_query("SELECT set_app_org($1)")
            .bind::<SqlUuid, _>(org)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        AnsiTransactionManager::begin_transaction(&mut self.conn)
            .map_err(|e| StoreError::Transaction(e.to_string()))?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.in_transaction = false;
        AnsiTransactionManager::commit_transaction(&mut self.conn).map_err(|e| {
            self.broken = true;
            StoreError::Transaction(e.to_string())
        })
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        AnsiTransactionManager::rollback_transaction(&mut self.conn).map_err(|e| {
            warn!("Rollback failed, discarding connection: {}", e);
            self.broken = true;
            StoreError::Transaction(e.to_string())
        })
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn ping(&mut self) -> Result<(), StoreError> {
        sql_query("SELECT 1").execute(&mut self.conn)?;
        Ok(())
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}

impl AuditLog for PgStore {
    fn insert_audit_record(&mut self, record: &AuditRecord) -> Result<(), StoreError> {
        diesel::insert_into(audit_records::table)
            .values(record)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn audit_records_for(
        &mut self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        Ok(audit_records::table
            .filter(audit_records::entity_type.eq(entity_type))
            .filter(audit_records::entity_id.eq(entity_id))
            .order((audit_records::created_at.asc(), audit_records::id.asc()))
            .load(&mut self.conn)?)
    }
}

impl LedgerStore for PgStore {
    fn insert_provenance(&mut self, record: &AiProvenance) -> Result<(), StoreError> {
        diesel::insert_into(ai_provenance::table)
            .values(record)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn provenance_records(
        &mut self,
        ticket_id: Option<Uuid>,
    ) -> Result<Vec<AiProvenance>, StoreError> {
        let mut query = ai_provenance::table
            .order(ai_provenance::created_at.asc())
            .into_boxed();
        if let Some(ticket) = ticket_id {
            query = query.filter(ai_provenance::ticket_id.eq(ticket));
        }
        Ok(query.load(&mut self.conn)?)
    }

    fn insert_security_event(&mut self, event: &AiSecurityEvent) -> Result<(), StoreError> {
        diesel::insert_into(ai_security_events::table)
            .values(event)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn security_events(&mut self) -> Result<Vec<AiSecurityEvent>, StoreError> {
        Ok(ai_security_events::table
            .order(ai_security_events::created_at.asc())
            .load(&mut self.conn)?)
    }

    fn insert_copilot_run(&mut self, run: &CopilotRun) -> Result<(), StoreError> {
        diesel::insert_into(copilot_runs::table)
            .values(CopilotRunRow::from(run))
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn copilot_run(&mut self, id: Uuid) -> Result<Option<CopilotRun>, StoreError> {
        copilot_runs::table
            .find(id)
            .first::<CopilotRunRow>(&mut self.conn)
            .optional()?
            .map(CopilotRun::try_from)
            .transpose()
    }

    fn copilot_runs(&mut self, ticket_id: Option<Uuid>) -> Result<Vec<CopilotRun>, StoreError> {
        let mut query = copilot_runs::table
            .order(copilot_runs::created_at.asc())
            .into_boxed();
        if let Some(ticket_id) = ticket_id {
            query = query.filter(copilot_runs::ticket_id.eq(ticket_id));
        }
        query
            .load::<CopilotRunRow>(&mut self.conn)?
            .into_iter()
            .map(CopilotRun::try_from)
            .collect()
    }

    fn finish_copilot_run(
        &mut self,
        id: Uuid,
        completion: &RunCompletion,
    ) -> Result<bool, StoreError> {
        let updated = diesel::update(
            copilot_runs::table
                .filter(copilot_runs::id.eq(id))
                .filter(copilot_runs::status.eq("pending")),
        )
        .set((
            copilot_runs::status.eq(completion.status.as_str()),
            copilot_runs::plan.eq(completion.plan.clone()),
            copilot_runs::tool_trace.eq(completion.tool_trace.clone()),
            copilot_runs::output.eq(completion.output.clone()),
            copilot_runs::latency_ms.eq(Some(completion.latency_ms)),
            copilot_runs::error.eq(completion.error.clone()),
            copilot_runs::completed_at.eq(Some(completion.completed_at)),
        ))
        .execute(&mut self.conn)?;
        Ok(updated == 1)
    }
}

impl PolicyRuleStore for PgStore {
    fn policy_rules(&mut self) -> Result<Vec<PolicyRule>, StoreError> {
        policy_rules::table
            .load::<PolicyRuleRow>(&mut self.conn)?
            .into_iter()
            .map(PolicyRule::try_from)
            .collect()
    }

    fn policy_rule(&mut self, id: Uuid) -> Result<Option<PolicyRule>, StoreError> {
        policy_rules::table
            .find(id)
            .first::<PolicyRuleRow>(&mut self.conn)
            .optional()?
            .map(PolicyRule::try_from)
            .transpose()
    }

    fn insert_policy_rule(&mut self, rule: &PolicyRule) -> Result<(), StoreError> {
        diesel::insert_into(policy_rules::table)
            .values(PolicyRuleRow::try_from(rule)?)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn update_policy_rule(&mut self, rule: &PolicyRule) -> Result<bool, StoreError> {
        let row = PolicyRuleRow::try_from(rule)?;
        let updated = diesel::update(policy_rules::table.find(rule.id))
            .set(&row)
            .execute(&mut self.conn)?;
        Ok(updated > 0)
    }

    fn delete_policy_rule(&mut self, id: Uuid) -> Result<bool, StoreError> {
        let deleted = diesel::delete(policy_rules::table.find(id)).execute(&mut self.conn)?;
        Ok(deleted > 0)
    }
}

impl WebhookStore for PgStore {
    fn webhooks_for_event(&mut self, event: &str) -> Result<Vec<Webhook>, StoreError> {
        let enabled: Vec<Webhook> = webhooks::table
            .filter(webhooks::enabled.eq(true))
            .order(webhooks::created_at.asc())
            .load(&mut self.conn)?;
        Ok(enabled
            .into_iter()
            .filter(|w| w.subscribes_to(event))
            .collect())
    }

    fn webhook(&mut self, id: Uuid) -> Result<Option<Webhook>, StoreError> {
        Ok(webhooks::table
            .find(id)
            .first(&mut self.conn)
            .optional()?)
    }

    fn insert_webhook(&mut self, webhook: &Webhook) -> Result<(), StoreError> {
        diesel::insert_into(webhooks::table)
            .values(webhook)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn record_webhook_success(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        diesel::update(webhooks::table.find(id))
            .set((
                webhooks::failure_count.eq(0),
                webhooks::last_triggered_at.eq(Some(at)),
                webhooks::updated_at.eq(at),
            ))
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn record_webhook_failure(
        &mut self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError> {
        Ok(diesel::update(webhooks::table.find(id))
            .set((
                webhooks::failure_count.eq(webhooks::failure_count + 1),
                webhooks::last_failure_reason.eq(Some(reason)),
                webhooks::last_triggered_at.eq(Some(at)),
                webhooks::updated_at.eq(at),
            ))
            .returning(webhooks::failure_count)
            .get_result(&mut self.conn)?)
    }

    fn disable_webhook(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        diesel::update(webhooks::table.find(id))
            .set((webhooks::enabled.eq(false), webhooks::updated_at.eq(at)))
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn insert_webhook_delivery(&mut self, delivery: &WebhookDelivery) -> Result<(), StoreError> {
        diesel::insert_into(webhook_deliveries::table)
            .values(delivery)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn webhook_deliveries(&mut self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>, StoreError> {
        Ok(webhook_deliveries::table
            .filter(webhook_deliveries::webhook_id.eq(webhook_id))
            .order(webhook_deliveries::created_at.asc())
            .load(&mut self.conn)?)
    }
}

impl TicketStore for PgStore {
    fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError> {
        diesel::insert_into(tickets::table)
            .values(ticket)
            .execute(&mut self.conn)?;
        Ok(())
    }

    fn tickets(&mut self) -> Result<Vec<Ticket>, StoreError> {
        Ok(tickets::table
            .order(tickets::created_at.asc())
            .load(&mut self.conn)?)
    }

    fn ticket(&mut self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        Ok(tickets::table
            .find(id)
            .first(&mut self.conn)
            .optional()?)
    }

    fn update_ticket(&mut self, ticket: &Ticket) -> Result<bool, StoreError> {
        let updated = diesel::update(tickets::table.find(ticket.id))
            .set(ticket)
            .execute(&mut self.conn)?;
        Ok(updated > 0)
    }
}

impl SchemaInspector for PgStore {
    fn rls_status(&mut self, tables: &[&str]) -> Result<Vec<TableRlsStatus>, StoreError> {
        let names: Vec<String> = tables.iter().map(|t| (*t).to_string()).collect();
        let rows = sql_query(RLS_STATUS_SQL)
            .bind::<Array<Text>, _>(names)
            .load::<RlsRow>(&mut self.conn)?;

        Ok(tables
            .iter()
            .map(|table| {
                rows.iter()
                    .find(|r| r.table_name == *table)
                    .map(|r| TableRlsStatus {
                        table: r.table_name.clone(),
                        rls_enabled: r.rls_enabled,
                        rls_forced: r.rls_forced,
                        policy_count: r.policy_count,
                    })
                    .unwrap_or_else(|| TableRlsStatus {
                        table: (*table).to_string(),
                        rls_enabled: false,
                        rls_forced: false,
                        policy_count: 0,
                    })
            })
            .collect())
    }
}
