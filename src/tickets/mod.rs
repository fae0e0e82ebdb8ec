//! Tickets: the reference tenant-scoped entity.
//!
//! Every mutation goes through a unit of work, asks the policy engine first,
//! and appends its audit row on the same transaction. Subscribers hear about
//! it only after the commit.

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::core::error::GovernanceError;
use crate::core::events::{DomainEvent, EventName};
use crate::core::gateway::{blocking, TenantGateway, UnitOfWork};
use crate::core::session::SessionContext;
use crate::core::shared::models::Ticket;
use crate::core::shared::state::AppState;
use crate::llm::copilot::CopilotTool;
use crate::security::audit::{AuditEntry, AuditRecorder};
use crate::security::policy::{DecisionRequest, PolicyEngine};

pub const ENTITY_TICKET: &str = "ticket";
pub const TARGET_TICKET: &str = "ticket";
pub const TARGET_TICKET_EXPORT: &str = "ticket.export";

pub const STATUSES: &[&str] = &["open", "pending", "resolved", "closed"];
pub const PRIORITIES: &[&str] = &["low", "normal", "high", "urgent"];

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTicketRequest {
    pub subject: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub requester_id: Option<Uuid>,
    #[serde(default)]
    pub assignee_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTicketRequest {
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub assignee_id: Option<Uuid>,
}

impl UpdateTicketRequest {
    pub fn status(status: &str) -> Self {
        Self {
            status: Some(status.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TicketExport {
    pub organization_id: Uuid,
    pub exported_at: chrono::DateTime<Utc>,
    pub tickets: Vec<Ticket>,
}

fn check_value(field: &str, value: &str, allowed: &[&str]) -> Result<(), GovernanceError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(GovernanceError::Validation(format!(
            "{field} must be one of {}",
            allowed.join(", ")
        )))
    }
}

fn to_value(ticket: &Ticket) -> Value {
    serde_json::to_value(ticket).unwrap_or_else(|_| json!({ "id": ticket.id }))
}

pub fn create_ticket(
    uow: &mut UnitOfWork,
    policy: &PolicyEngine,
    audit: &AuditRecorder,
    req: CreateTicketRequest,
) -> Result<Ticket, GovernanceError> {
    let subject = req.subject.trim();
    if subject.is_empty() {
        return Err(GovernanceError::Validation("subject is required".into()));
    }
    let priority = req.priority.unwrap_or_else(|| "normal".to_string());
    check_value("priority", &priority, PRIORITIES)?;

    let session = uow.session().clone();
    policy.enforce(
        uow.read(),
        &DecisionRequest::new(TARGET_TICKET, "create", &session).with("priority", priority.as_str()),
    )?;

    let now = Utc::now();
    let ticket = Ticket {
        id: Uuid::new_v4(),
        organization_id: session.organization_id,
        subject: subject.to_string(),
        description: req.description,
        status: "open".to_string(),
        priority,
        requester_id: req.requester_id.or(Some(session.user_id)),
        assignee_id: req.assignee_id,
        created_at: now,
        updated_at: now,
    };

    uow.write()?.insert_ticket(&ticket)?;
    audit.record(
        uow,
        AuditEntry::created(ENTITY_TICKET, &ticket.id.to_string(), to_value(&ticket))
            .with_event(EventName::TicketCreated),
    )?;
    Ok(ticket)
}

/// Applies `req` to the ticket. An update that changes nothing writes
/// nothing and returns the ticket as stored.
pub fn update_ticket(
    uow: &mut UnitOfWork,
    policy: &PolicyEngine,
    audit: &AuditRecorder,
    id: Uuid,
    req: UpdateTicketRequest,
) -> Result<Ticket, GovernanceError> {
    let existing = uow
        .read()
        .ticket(id)?
        .ok_or_else(|| GovernanceError::NotFound(format!("ticket {id}")))?;

    let mut updated = existing.clone();
    if let Some(subject) = req.subject {
        if subject.trim().is_empty() {
            return Err(GovernanceError::Validation("subject is required".into()));
        }
        updated.subject = subject.trim().to_string();
    }
    if let Some(description) = req.description {
        updated.description = Some(description);
    }
    if let Some(status) = req.status {
        check_value("status", &status, STATUSES)?;
        updated.status = status;
    }
    if let Some(priority) = req.priority {
        check_value("priority", &priority, PRIORITIES)?;
        updated.priority = priority;
    }
    if req.assignee_id.is_some() {
        updated.assignee_id = req.assignee_id;
    }
    if updated == existing {
        return Ok(existing);
    }

    let resolved = updated.status == "resolved" && existing.status != "resolved";
    let action = if resolved { "resolve" } else { "update" };
    let session = uow.session().clone();
    policy.enforce(
        uow.read(),
        &DecisionRequest::new(TARGET_TICKET, action, &session)
            .with("status", updated.status.as_str())
            .with("previous_status", existing.status.as_str())
            .with("priority", updated.priority.as_str()),
    )?;

    updated.updated_at = Utc::now();
    if !uow.write()?.update_ticket(&updated)? {
        return Err(GovernanceError::NotFound(format!("ticket {id}")));
    }

    let mut entry = AuditEntry::updated(
        ENTITY_TICKET,
        &id.to_string(),
        to_value(&existing),
        to_value(&updated),
    )
    .with_event(EventName::TicketUpdated);
    if resolved {
        entry = entry.with_action("ticket.resolved");
    }
    let record = audit.record(uow, entry)?;

    if resolved {
        uow.enqueue(
            DomainEvent::new(
                EventName::TicketResolved,
                session.organization_id,
                to_value(&updated),
            )
            .with_actor(session.user_id)
            .with_changes(
                record.old_values.as_ref().and_then(Value::as_object).cloned(),
                record.new_values.as_ref().and_then(Value::as_object).cloned(),
            ),
        );
    }
    Ok(updated)
}

/// Tickets visible to `ctx`. Without a context the connection sees none.
pub fn list_tickets(
    gateway: &TenantGateway,
    ctx: Option<&SessionContext>,
) -> Result<Vec<Ticket>, GovernanceError> {
    let mut conn = gateway.acquire(ctx)?;
    let mut tickets = conn.read().tickets()?;
    tickets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(tickets)
}

pub fn get_ticket(
    gateway: &TenantGateway,
    ctx: &SessionContext,
    id: Uuid,
) -> Result<Ticket, GovernanceError> {
    let mut conn = gateway.acquire(Some(ctx))?;
    conn.read()
        .ticket(id)?
        .ok_or_else(|| GovernanceError::NotFound(format!("ticket {id}")))
}

/// Bulk export, denied unless a rule allows it.
pub fn export_tickets(
    gateway: &TenantGateway,
    policy: &PolicyEngine,
    ctx: &SessionContext,
) -> Result<TicketExport, GovernanceError> {
    let mut conn = gateway.acquire(Some(ctx))?;
    policy.enforce(conn.read(), &DecisionRequest::new(TARGET_TICKET_EXPORT, "export", ctx))?;
    let tickets = conn.read().tickets()?;
    info!(
        org_id = %ctx.organization_id,
        user_id = %ctx.user_id,
        count = tickets.len(),
        "Tickets exported"
    );
    Ok(TicketExport {
        organization_id: ctx.organization_id,
        exported_at: Utc::now(),
        tickets,
    })
}

/// Copilot tool reading one ticket of the caller's tenant.
pub struct TicketLookupTool {
    gateway: TenantGateway,
}

impl TicketLookupTool {
    pub fn new(gateway: TenantGateway) -> Self {
        Self { gateway }
    }
}

#[async_trait]
impl CopilotTool for TicketLookupTool {
    fn name(&self) -> &str {
        "lookup_ticket"
    }

    async fn invoke(&self, ctx: &SessionContext, input: &Value) -> Result<Value, GovernanceError> {
        let id = input
            .get("id")
            .and_then(Value::as_str)
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| GovernanceError::Validation("lookup_ticket needs a ticket id".into()))?;
        let gateway = self.gateway.clone();
        let ctx = ctx.clone();
        let ticket = blocking(move || get_ticket(&gateway, &ctx, id)).await?;
        Ok(json!({
            "id": ticket.id,
            "subject": ticket.subject,
            "status": ticket.status,
            "priority": ticket.priority,
            "description": ticket.description,
        }))
    }
}

pub async fn handle_create_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateTicketRequest>,
) -> Result<Json<Ticket>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let ticket = blocking(move || {
        let mut uow = state.gateway.enter(&ctx)?;
        let ticket = create_ticket(&mut uow, &state.policy, &state.audit, req)?;
        state.audit.commit(uow)?;
        Ok(ticket)
    })
    .await?;
    Ok(Json(ticket))
}

pub async fn handle_list_tickets(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Ticket>>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let tickets = blocking(move || list_tickets(&state.gateway, Some(&ctx))).await?;
    Ok(Json(tickets))
}

pub async fn handle_get_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Ticket>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let ticket = blocking(move || get_ticket(&state.gateway, &ctx, id)).await?;
    Ok(Json(ticket))
}

pub async fn handle_update_ticket(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTicketRequest>,
) -> Result<Json<Ticket>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let ticket = blocking(move || {
        let mut uow = state.gateway.enter(&ctx)?;
        let ticket = update_ticket(&mut uow, &state.policy, &state.audit, id, req)?;
        state.audit.commit(uow)?;
        Ok(ticket)
    })
    .await?;
    Ok(Json(ticket))
}

pub async fn handle_ticket_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let records = blocking(move || {
        state
            .audit
            .audit_trail(&state.gateway, &ctx, ENTITY_TICKET, &id.to_string())
    })
    .await?;
    Ok(Json(json!({ "ticket_id": id, "audit": records })))
}

pub async fn handle_export_tickets(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<TicketExport>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let export = blocking(move || export_tickets(&state.gateway, &state.policy, &ctx)).await?;
    Ok(Json(export))
}

pub fn configure_tickets_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tickets", get(handle_list_tickets).post(handle_create_ticket))
        .route("/api/tickets/export", get(handle_export_tickets))
        .route("/api/tickets/:id", get(handle_get_ticket).put(handle_update_ticket))
        .route("/api/tickets/:id/history", get(handle_ticket_history))
}
