//! AI provenance ledger.
//!
//! One append-only row per AI artifact, committed before the artifact is
//! returned. A [`ProvenanceReceipt`] exists only for a committed row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, error};
use uuid::Uuid;

use crate::core::error::GovernanceError;
use crate::core::gateway::TenantGateway;
use crate::core::session::SessionContext;
use crate::core::shared::models::{AiProvenance, AiSecurityEvent};
use crate::security::policy::Decision;
use crate::security::prompt_firewall::snippet_hash;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceDocument {
    pub document_id: String,
    pub score: f64,
}

/// Minimum trace needed to reproduce an artifact.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Evidence {
    pub model_id: String,
    pub prompt_template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval_query: Option<String>,
    #[serde(default)]
    pub documents: Vec<EvidenceDocument>,
    #[serde(default)]
    pub tools: Vec<Value>,
    /// Security events raised while inspecting the inputs.
    #[serde(default)]
    pub input_events: Vec<Uuid>,
    /// SHA-256 of the artifact text.
    pub output_hash: String,
}

impl Evidence {
    pub fn new(model_id: &str, prompt_template_id: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            prompt_template_id: prompt_template_id.to_string(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.retrieval_query = Some(query.to_string());
        self
    }

    pub fn with_document(mut self, document_id: &str, score: f64) -> Self {
        self.documents.push(EvidenceDocument {
            document_id: document_id.to_string(),
            score,
        });
        self
    }

    pub fn with_tool(mut self, call: Value) -> Self {
        self.tools.push(call);
        self
    }

    pub fn with_input_event(mut self, event_id: Option<Uuid>) -> Self {
        self.input_events.extend(event_id);
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.output_hash = hex::encode(Sha256::digest(output.as_bytes()));
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "model_id": self.model_id }))
    }
}

#[derive(Debug, Clone)]
pub struct ProvenanceEntry {
    pub feature: String,
    pub ticket_id: Option<Uuid>,
    pub evidence: Evidence,
    pub confidence: f64,
    pub risk_score: f64,
    pub decision: Decision,
}

/// Proof that a provenance row is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvenanceReceipt {
    id: Uuid,
    committed_at: DateTime<Utc>,
}

impl ProvenanceReceipt {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }
}

fn unit_interval(name: &str, value: f64) -> Result<f64, GovernanceError> {
    if value.is_nan() {
        return Err(GovernanceError::Validation(format!("{name} is NaN")));
    }
    Ok(value.clamp(0.0, 1.0))
}

/// The artifact hash, or with no artifact the hash of what prompted it.
fn failure_snippet_hash(entry: &ProvenanceEntry) -> String {
    if !entry.evidence.output_hash.is_empty() {
        return entry.evidence.output_hash.clone();
    }
    match &entry.evidence.retrieval_query {
        Some(query) => snippet_hash(query),
        None => snippet_hash(&format!(
            "{}:{}:{}",
            entry.feature, entry.evidence.prompt_template_id, entry.evidence.model_id
        )),
    }
}

#[derive(Debug, Clone)]
pub struct ProvenanceLedger {
    gateway: TenantGateway,
}

impl ProvenanceLedger {
    pub fn new(gateway: TenantGateway) -> Self {
        Self { gateway }
    }

    /// Writes and commits the provenance row on its own unit of work. On any
    /// failure a `provenance_write_failed` security event is recorded
    /// separately and `ProvenanceWriteFailed` is returned; the artifact must
    /// then be discarded.
    pub fn record(
        &self,
        ctx: &SessionContext,
        entry: &ProvenanceEntry,
    ) -> Result<ProvenanceReceipt, GovernanceError> {
        match self.try_record(ctx, entry) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                error!(
                    org_id = %ctx.organization_id,
                    feature = %entry.feature,
                    "Provenance write failed: {}",
                    e
                );
                self.record_failure(ctx, entry, &e);
                Err(GovernanceError::ProvenanceWriteFailed(e.to_string()))
            }
        }
    }

    fn try_record(
        &self,
        ctx: &SessionContext,
        entry: &ProvenanceEntry,
    ) -> Result<ProvenanceReceipt, GovernanceError> {
        let row = AiProvenance {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            ticket_id: entry.ticket_id,
            feature: entry.feature.clone(),
            evidence: entry.evidence.to_value(),
            confidence: unit_interval("confidence", entry.confidence)?,
            risk_score: unit_interval("risk_score", entry.risk_score)?,
            policy_decision: entry.decision.to_value(),
            created_at: Utc::now(),
        };

        let mut uow = self.gateway.enter(ctx)?;
        uow.write()?.insert_provenance(&row)?;
        uow.commit()?;

        debug!(provenance_id = %row.id, feature = %row.feature, "Provenance committed");
        Ok(ProvenanceReceipt {
            id: row.id,
            committed_at: Utc::now(),
        })
    }

    fn record_failure(&self, ctx: &SessionContext, entry: &ProvenanceEntry, cause: &GovernanceError) {
        let event = AiSecurityEvent {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            user_id: Some(ctx.user_id),
            ticket_id: entry.ticket_id,
            event_type: "provenance_write_failed".to_string(),
            risk_score: if entry.risk_score.is_nan() {
                0.0
            } else {
                entry.risk_score.clamp(0.0, 1.0)
            },
            flags: json!({
                "feature": entry.feature,
                "error": cause.kind(),
                "model_id": entry.evidence.model_id,
            }),
            snippet_hash: failure_snippet_hash(entry),
            created_at: Utc::now(),
        };

        let written = self.gateway.enter(ctx).and_then(|mut uow| {
            uow.write()?.insert_security_event(&event)?;
            uow.commit().map(|_| ())
        });
        if let Err(e) = written {
            error!(org_id = %ctx.organization_id, "Could not record provenance failure: {}", e);
        }
    }

    /// Provenance rows of the caller's tenant, optionally for one ticket.
    pub fn history(
        &self,
        ctx: &SessionContext,
        ticket_id: Option<Uuid>,
    ) -> Result<Vec<AiProvenance>, GovernanceError> {
        let mut conn = self.gateway.acquire(Some(ctx))?;
        Ok(conn.read().provenance_records(ticket_id)?)
    }
}
