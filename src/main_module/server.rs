//! HTTP surface: routing and server lifecycle.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::core::error::GovernanceError;
use crate::core::gateway::blocking;
use crate::core::session::SessionContext;
use crate::core::shared::models::{AiProvenance, WebhookDelivery};
use crate::core::shared::state::AppState;
use crate::llm::copilot::{Copilot, CopilotRequest};
use crate::llm::governed::AiGovernor;
use crate::security::policy::{DecisionRequest, PolicyRule, RuleDraft};
use crate::security::webhook::NewWebhook;
use crate::tickets::configure_tickets_routes;

use super::{health_check, rls_health};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/internal/rls/health", get(rls_health))
        .merge(configure_tickets_routes())
        .merge(configure_policy_routes())
        .merge(configure_webhook_routes())
        .merge(configure_ai_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>) -> std::io::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let app = build_router(state);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind to {}: {} - is another instance running?", addr, e);
            return Err(e);
        }
    };
    info!("HTTP server listening on {}", addr);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(std::io::Error::other)
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        return;
    }
    info!("Shutdown signal received");
}

// Policy administration

fn configure_policy_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/policy/rules", get(list_rules).post(create_rule))
        .route("/api/policy/rules/:id", put(update_rule).delete(delete_rule))
        .route("/api/policy/evaluate", post(evaluate))
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<PolicyRule>>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let rules = blocking(move || {
        let mut conn = state.gateway.acquire(Some(&ctx))?;
        Ok(conn.read().policy_rules()?)
    })
    .await?;
    Ok(Json(rules))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<PolicyRule>), GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let rule = blocking(move || {
        let mut uow = state.gateway.enter(&ctx)?;
        let rule = state.policy.create_rule(&mut uow, &state.audit, draft)?;
        state.audit.commit(uow)?;
        Ok(rule)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(rule)))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(draft): Json<RuleDraft>,
) -> Result<Json<PolicyRule>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let rule = blocking(move || {
        let mut uow = state.gateway.enter(&ctx)?;
        let rule = state.policy.update_rule(&mut uow, &state.audit, id, draft)?;
        state.audit.commit(uow)?;
        Ok(rule)
    })
    .await?;
    Ok(Json(rule))
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    blocking(move || {
        let mut uow = state.gateway.enter(&ctx)?;
        state.policy.delete_rule(&mut uow, &state.audit, id)?;
        state.audit.commit(uow).map(|_| ())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EvaluateRequest {
    target: String,
    action: String,
    #[serde(default)]
    attributes: Map<String, Value>,
}

/// Dry-run decision for the caller. Never raises `PolicyDeny`.
async fn evaluate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<EvaluateRequest>,
) -> Result<Json<Value>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let decision = blocking(move || {
        let request = DecisionRequest::new(&req.target, &req.action, &ctx).with_context(req.attributes);
        let mut conn = state.gateway.acquire(Some(&ctx))?;
        state.policy.evaluate(conn.read(), &request)
    })
    .await?;
    Ok(Json(decision.to_value()))
}

// Webhooks

fn configure_webhook_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/webhooks", post(register_webhook))
        .route("/api/webhooks/:id/deliveries", get(list_deliveries))
}

/// The secret is returned here and nowhere else.
async fn register_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<NewWebhook>,
) -> Result<(StatusCode, Json<Value>), GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let webhook = blocking(move || {
        let mut uow = state.gateway.enter(&ctx)?;
        let webhook = state
            .dispatcher
            .register(&mut uow, &state.policy, &state.audit, req)?;
        state.audit.commit(uow)?;
        Ok(webhook)
    })
    .await?;
    let secret = webhook.secret.clone();
    Ok((
        StatusCode::CREATED,
        Json(json!({ "webhook": webhook, "secret": secret })),
    ))
}

async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<WebhookDelivery>>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let deliveries = blocking(move || {
        let mut conn = state.gateway.acquire(Some(&ctx))?;
        if conn.read().webhook(id)?.is_none() {
            return Err(GovernanceError::NotFound(format!("webhook {id}")));
        }
        Ok(conn.read().webhook_deliveries(id)?)
    })
    .await?;
    Ok(Json(deliveries))
}

// Governed AI

fn configure_ai_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/ai/sentiment", post(score_sentiment))
        .route("/api/ai/reply", post(generate_reply))
        .route("/api/ai/copilot", post(run_copilot))
        .route("/api/ai/provenance", get(provenance_history))
}

fn governor(state: &AppState) -> Result<&AiGovernor, GovernanceError> {
    state
        .governor
        .as_ref()
        .ok_or_else(|| GovernanceError::NotFound("AI features are not configured".into()))
}

fn copilot(state: &AppState) -> Result<&Arc<Copilot>, GovernanceError> {
    state
        .copilot
        .as_ref()
        .ok_or_else(|| GovernanceError::NotFound("AI features are not configured".into()))
}

#[derive(Debug, Deserialize)]
struct SentimentRequest {
    #[serde(default)]
    ticket_id: Option<Uuid>,
    text: String,
}

async fn score_sentiment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<SentimentRequest>,
) -> Result<Json<Value>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let surfaced = governor(&state)?
        .score_sentiment(&ctx, req.ticket_id, &req.text)
        .await?;
    Ok(Json(surfaced.to_json()))
}

#[derive(Debug, Deserialize)]
struct ReplyRequest {
    #[serde(default)]
    ticket_id: Option<Uuid>,
    message: String,
}

async fn generate_reply(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<ReplyRequest>,
) -> Result<Json<Value>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let surfaced = governor(&state)?
        .generate_reply(&ctx, req.ticket_id, &req.message)
        .await?;
    Ok(Json(surfaced.to_json()))
}

async fn run_copilot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CopilotRequest>,
) -> Result<Json<Value>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let cancel = CancellationToken::new();
    // A client disconnect drops this future and cancels the run.
    let _cancel_on_drop = cancel.clone().drop_guard();
    let surfaced = copilot(&state)?.run(&ctx, req, cancel).await?;
    Ok(Json(surfaced.to_json()))
}

#[derive(Debug, Deserialize)]
struct ProvenanceQuery {
    #[serde(default)]
    ticket_id: Option<Uuid>,
}

async fn provenance_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ProvenanceQuery>,
) -> Result<Json<Vec<AiProvenance>>, GovernanceError> {
    let ctx = SessionContext::from_headers(&headers)?;
    let ledger = governor(&state)?.ledger().clone();
    let rows = blocking(move || ledger.history(&ctx, query.ticket_id)).await?;
    Ok(Json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::AppConfig;
    use crate::core::gateway::TenantGateway;
    use crate::core::session::{HEADER_ORGANIZATION_ID, HEADER_USER_ID, HEADER_USER_ROLE};
    use crate::core::shared::state::AppStateBuilder;
    use crate::core::store::MemoryDatabase;
    use crate::security::webhook::{OutboundRequest, WebhookTransport};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Accepting;

    #[async_trait]
    impl WebhookTransport for Accepting {
        async fn post(&self, _request: &OutboundRequest, _timeout: Duration) -> Result<u16, String> {
            Ok(200)
        }
    }

    fn app(db: &MemoryDatabase) -> Router {
        let gateway = TenantGateway::in_memory(db, 4, Duration::from_millis(200)).unwrap();
        let state = AppStateBuilder::new(AppConfig::default(), gateway)
            .transport(Arc::new(Accepting))
            .build()
            .unwrap();
        build_router(Arc::new(state))
    }

    fn request(method: &str, uri: &str, org: Uuid, role: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(HEADER_ORGANIZATION_ID, org.to_string())
            .header(HEADER_USER_ID, Uuid::new_v4().to_string())
            .header(HEADER_USER_ROLE, role)
            .header("content-type", "application/json");
        match body {
            Some(body) => builder.body(Body::from(body.to_string())).unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_rls_health_reports_tables() {
        let db = MemoryDatabase::new();
        let response = app(&db)
            .oneshot(Request::builder().uri("/internal/rls/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["context"]["is_set"], false);
        assert!(body["tables"].as_array().is_some_and(|t| !t.is_empty()));
    }

    #[tokio::test]
    async fn test_rls_health_degraded_when_table_unprotected() {
        let db = MemoryDatabase::new();
        db.disable_row_security("tickets");
        let response = app(&db)
            .oneshot(Request::builder().uri("/internal/rls/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["status"], "degraded");
    }

    #[tokio::test]
    async fn test_ticket_routes_need_context() {
        let db = MemoryDatabase::new();
        let response = app(&db)
            .oneshot(Request::builder().uri("/api/tickets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "context_missing");
    }

    #[tokio::test]
    async fn test_create_then_list_ticket() {
        let db = MemoryDatabase::new();
        let app = app(&db);
        let org = Uuid::new_v4();

        let created = app
            .clone()
            .oneshot(request(
                "POST",
                "/api/tickets",
                org,
                "agent",
                Some(json!({ "subject": "Cannot log in" })),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);

        let listed = app
            .oneshot(request("GET", "/api/tickets", org, "agent", None))
            .await
            .unwrap();
        let body = body_json(listed).await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
        assert_eq!(body[0]["subject"], "Cannot log in");
    }

    #[tokio::test]
    async fn test_webhook_registration_is_deny_by_default() {
        let db = MemoryDatabase::new();
        let response = app(&db)
            .oneshot(request(
                "POST",
                "/api/webhooks",
                Uuid::new_v4(),
                "admin",
                Some(json!({ "url": "https://hooks.example.com/in", "event_types": ["ticket.created"] })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ai_routes_off_without_endpoint() {
        let db = MemoryDatabase::new();
        let response = app(&db)
            .oneshot(request(
                "POST",
                "/api/ai/reply",
                Uuid::new_v4(),
                "agent",
                Some(json!({ "message": "hello" })),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
