//! Backing store connections.
//!
//! Every connection handed out by the pool implements [`StoreConnection`],
//! the union of one small trait per concern. The Postgres backend enforces
//! tenant rows through row-level security policies installed by the
//! migrations; the memory backend applies the same read filter, write-role
//! sets and append-only rules in process.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use diesel::r2d2::{ManageConnection, Pool};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::core::session::{Role, PARAM_CURRENT_ORG};
use crate::core::shared::models::{
    AiProvenance, AiSecurityEvent, AuditRecord, CopilotRun, RunCompletion, TableRlsStatus, Ticket,
    Webhook, WebhookDelivery,
};
use crate::security::policy::PolicyRule;

pub use memory::MemoryDatabase;

pub type DbPool = Pool<StoreManager>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Row filter rejected write to {table}")]
    PolicyViolation { table: String },
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Migration error: {0}")]
    Migration(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        let message = err.to_string();
        if message.contains("row-level security") {
            let table = message
                .split('"')
                .nth(1)
                .unwrap_or("unknown")
                .to_string();
            return Self::PolicyViolation { table };
        }
        Self::Query(message)
    }
}

impl From<diesel::ConnectionError> for StoreError {
    fn from(err: diesel::ConnectionError) -> Self {
        Self::Connection(err.to_string())
    }
}

/// Connection-level runtime parameters and transaction control.
pub trait SessionParams {
    /// Sets a runtime parameter for the rest of the session. `None` clears it.
    fn set_parameter(&mut self, name: &str, value: Option<&str>) -> Result<(), StoreError>;

    fn parameter(&mut self, name: &str) -> Result<Option<String>, StoreError>;

    fn set_app_org(&mut self, org: Uuid) -> Result<(), StoreError> {
        self.set_parameter(PARAM_CURRENT_ORG, Some(&org.to_string()))
    }

    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;
    fn in_transaction(&self) -> bool;

    fn ping(&mut self) -> Result<(), StoreError>;

    /// Flags the connection so the pool discards it instead of reusing it.
    fn mark_broken(&mut self);
    fn is_broken(&self) -> bool;
}

/// Insert-only access to `audit_records`.
pub trait AuditLog {
    fn insert_audit_record(&mut self, record: &AuditRecord) -> Result<(), StoreError>;
    fn audit_records_for(
        &mut self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<AuditRecord>, StoreError>;
}

/// Provenance, security events and copilot runs.
pub trait LedgerStore {
    fn insert_provenance(&mut self, record: &AiProvenance) -> Result<(), StoreError>;
    fn provenance_records(&mut self, ticket_id: Option<Uuid>)
        -> Result<Vec<AiProvenance>, StoreError>;

    fn insert_security_event(&mut self, event: &AiSecurityEvent) -> Result<(), StoreError>;
    fn security_events(&mut self) -> Result<Vec<AiSecurityEvent>, StoreError>;

    fn insert_copilot_run(&mut self, run: &CopilotRun) -> Result<(), StoreError>;
    fn copilot_run(&mut self, id: Uuid) -> Result<Option<CopilotRun>, StoreError>;
    fn copilot_runs(&mut self, ticket_id: Option<Uuid>) -> Result<Vec<CopilotRun>, StoreError>;
    /// Moves a pending run to its terminal state. Returns `false` when the
    /// run is missing or already terminal.
    fn finish_copilot_run(&mut self, id: Uuid, completion: &RunCompletion)
        -> Result<bool, StoreError>;
}

pub trait PolicyRuleStore {
    /// Rules visible to the session: the tenant's own plus global ones.
    fn policy_rules(&mut self) -> Result<Vec<PolicyRule>, StoreError>;
    fn policy_rule(&mut self, id: Uuid) -> Result<Option<PolicyRule>, StoreError>;
    fn insert_policy_rule(&mut self, rule: &PolicyRule) -> Result<(), StoreError>;
    fn update_policy_rule(&mut self, rule: &PolicyRule) -> Result<bool, StoreError>;
    fn delete_policy_rule(&mut self, id: Uuid) -> Result<bool, StoreError>;
}

pub trait WebhookStore {
    /// Enabled webhooks of the session tenant subscribed to `event`.
    fn webhooks_for_event(&mut self, event: &str) -> Result<Vec<Webhook>, StoreError>;
    fn webhook(&mut self, id: Uuid) -> Result<Option<Webhook>, StoreError>;
    fn insert_webhook(&mut self, webhook: &Webhook) -> Result<(), StoreError>;
    fn record_webhook_success(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    /// Increments `failure_count` and returns the new value.
    fn record_webhook_failure(
        &mut self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<i32, StoreError>;
    fn disable_webhook(&mut self, id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError>;
    fn insert_webhook_delivery(&mut self, delivery: &WebhookDelivery) -> Result<(), StoreError>;
    fn webhook_deliveries(&mut self, webhook_id: Uuid) -> Result<Vec<WebhookDelivery>, StoreError>;
}

pub trait TicketStore {
    fn insert_ticket(&mut self, ticket: &Ticket) -> Result<(), StoreError>;
    fn tickets(&mut self) -> Result<Vec<Ticket>, StoreError>;
    fn ticket(&mut self, id: Uuid) -> Result<Option<Ticket>, StoreError>;
    fn update_ticket(&mut self, ticket: &Ticket) -> Result<bool, StoreError>;
}

pub trait SchemaInspector {
    fn rls_status(&mut self, tables: &[&str]) -> Result<Vec<TableRlsStatus>, StoreError>;
}

pub trait StoreConnection:
    SessionParams
    + AuditLog
    + LedgerStore
    + PolicyRuleStore
    + WebhookStore
    + TicketStore
    + SchemaInspector
    + Send
{
}

impl<T> StoreConnection for T where
    T: SessionParams
        + AuditLog
        + LedgerStore
        + PolicyRuleStore
        + WebhookStore
        + TicketStore
        + SchemaInspector
        + Send
{
}

/// Roles allowed to write rows of `table` when they belong to the session
/// tenant. Tables absent from the list accept no writes at all.
pub fn write_roles(table: &str) -> &'static [Role] {
    const ALL: &[Role] = &[
        Role::Admin,
        Role::Manager,
        Role::Agent,
        Role::Customer,
        Role::System,
    ];
    const STAFF: &[Role] = &[Role::Admin, Role::Manager, Role::Agent, Role::System];
    const ADMIN: &[Role] = &[Role::Admin, Role::System];

    match table {
        "tickets" | "audit_records" | "ai_provenance" | "ai_security_events" => ALL,
        "copilot_runs" => STAFF,
        "policy_rules" | "webhooks" | "webhook_deliveries" => ADMIN,
        _ => &[],
    }
}

#[derive(Debug, Clone)]
pub enum StoreManager {
    Postgres { url: String },
    Memory(MemoryDatabase),
}

impl StoreManager {
    pub fn postgres(url: &str) -> Self {
        Self::Postgres {
            url: url.to_string(),
        }
    }

    pub fn memory(db: MemoryDatabase) -> Self {
        Self::Memory(db)
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Postgres { .. } => "postgres",
            Self::Memory(_) => "memory",
        }
    }
}

impl ManageConnection for StoreManager {
    type Connection = Box<dyn StoreConnection>;
    type Error = StoreError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        match self {
            Self::Postgres { url } => Ok(Box::new(postgres::PgStore::establish(url)?)),
            Self::Memory(db) => Ok(Box::new(db.connect())),
        }
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping()
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}

pub fn build_pool(
    manager: StoreManager,
    max_size: u32,
    checkout_timeout: Duration,
) -> Result<DbPool, StoreError> {
    let backend = manager.backend_name();
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(checkout_timeout)
        .test_on_check_out(false)
        .build(manager)
        .map_err(|e| StoreError::Connection(e.to_string()))?;
    info!(backend, max_size, "Store pool ready");
    Ok(pool)
}
