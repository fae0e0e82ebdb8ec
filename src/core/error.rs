use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::core::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    #[error("Session context missing")]
    ContextMissing,
    #[error("Session context already entered on this connection")]
    ContextAlreadyEntered,
    #[error("Connection pool exhausted: {0}")]
    PoolExhausted(String),
    #[error("Denied by policy rule '{rule}': {reason}")]
    PolicyDeny { rule: String, reason: String },
    #[error("Prompt blocked with risk score {risk_score:.2}")]
    PromptBlocked { risk_score: f64, flags: Vec<String> },
    #[error("Provenance write failed: {0}")]
    ProvenanceWriteFailed(String),
    #[error("Webhook transport failed: {0}")]
    WebhookTransportFailed(String),
    #[error("Audit write failed: {0}")]
    AuditWriteFailed(String),
    #[error("Row-level security inactive on: {}", .0.join(", "))]
    RlsDisabled(Vec<String>),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("LLM error: {0}")]
    Llm(String),
    #[error("Timed out: {0}")]
    Timeout(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl GovernanceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ContextMissing => "context_missing",
            Self::ContextAlreadyEntered => "context_already_entered",
            Self::PoolExhausted(_) => "pool_exhausted",
            Self::PolicyDeny { .. } => "policy_deny",
            Self::PromptBlocked { .. } => "prompt_blocked",
            Self::ProvenanceWriteFailed(_) => "provenance_write_failed",
            Self::WebhookTransportFailed(_) => "webhook_transport_failed",
            Self::AuditWriteFailed(_) => "audit_write_failed",
            Self::RlsDisabled(_) => "rls_disabled",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::Llm(_) => "llm",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Store(_) => "store",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PoolExhausted(_) | Self::RlsDisabled(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::PolicyDeny { .. } => StatusCode::FORBIDDEN,
            Self::PromptBlocked { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Llm(_) | Self::WebhookTransportFailed(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Cancelled => StatusCode::REQUEST_TIMEOUT,
            Self::Store(StoreError::PolicyViolation { .. }) => StatusCode::FORBIDDEN,
            Self::ContextMissing
            | Self::ContextAlreadyEntered
            | Self::ProvenanceWriteFailed(_)
            | Self::AuditWriteFailed(_)
            | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GovernanceError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(kind = self.kind(), "Request failed: {}", self);
        }

        let body = match &self {
            Self::PolicyDeny { rule, .. } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "rule": rule,
            }),
            Self::PromptBlocked { risk_score, flags } => json!({
                "error": self.kind(),
                "message": self.to_string(),
                "risk_score": risk_score,
                "flags": flags,
            }),
            // Internal details stay in the log.
            _ if status == StatusCode::INTERNAL_SERVER_ERROR => json!({
                "error": self.kind(),
                "message": "internal error",
            }),
            _ => json!({ "error": self.kind(), "message": self.to_string() }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GovernanceError::ContextMissing.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GovernanceError::PoolExhausted("timed out".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GovernanceError::PolicyDeny {
                rule: "block-risky".into(),
                reason: "matched".into()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GovernanceError::PromptBlocked {
                risk_score: 0.9,
                flags: vec![]
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            GovernanceError::ProvenanceWriteFailed("disk".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GovernanceError::Store(StoreError::PolicyViolation {
                table: "tickets".into()
            })
            .status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_deny_message_names_rule() {
        let err = GovernanceError::PolicyDeny {
            rule: "no-exports".into(),
            reason: "target denied by default".into(),
        };
        assert!(err.to_string().contains("no-exports"));
    }

    #[test]
    fn test_rls_disabled_lists_tables() {
        let err = GovernanceError::RlsDisabled(vec!["tickets".into(), "webhooks".into()]);
        assert_eq!(
            err.to_string(),
            "Row-level security inactive on: tickets, webhooks"
        );
    }
}
