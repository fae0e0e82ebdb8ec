//! Liveness and row-level security health.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::core::error::GovernanceError;
use crate::core::gateway::blocking;
use crate::core::session::{ContextReadback, SessionContext};
use crate::core::shared::state::AppState;

pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let store_ok = blocking(move || {
        let mut conn = state.gateway.acquire(None)?;
        conn.read().ping()?;
        Ok(())
    })
    .await
    .is_ok();

    let (status, code) = if store_ok {
        ("healthy", StatusCode::OK)
    } else {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    };

    (
        code,
        Json(json!({
            "status": status,
            "service": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "database": store_ok,
        })),
    )
}

/// `GET /internal/rls/health`. Bound to the internal listener only.
///
/// When the caller forwards context headers, the readback shows what the
/// store sees after binding them; otherwise it shows an unbound connection.
pub async fn rls_health(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), GovernanceError> {
    let ctx = SessionContext::from_headers(&headers).ok();

    let (tables, readback) = blocking(move || {
        let tables = state.gateway.rls_status()?;
        let mut conn = state.gateway.acquire(ctx.as_ref())?;
        let readback: ContextReadback = conn.validate_context()?;
        Ok((tables, readback))
    })
    .await?;

    let healthy = tables.iter().all(|t| t.is_protected());
    let policy_count: i64 = tables.iter().map(|t| t.policy_count).sum();
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((
        code,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "tables": tables,
            "policy_count": policy_count,
            "context": readback,
        })),
    ))
}
