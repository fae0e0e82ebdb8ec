//! Prompt firewall.
//!
//! Scans text bound for an LLM prompt, scores it, asks the policy engine
//! what to do (`ai.input`, action = feature), and appends a security event
//! carrying only a SHA-256 of the normalized snippet.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::config::FirewallConfig;
use crate::core::error::GovernanceError;
use crate::core::gateway::TenantGateway;
use crate::core::session::SessionContext;
use crate::core::shared::models::AiSecurityEvent;
use crate::security::policy::{
    Condition, Decision, DecisionRequest, Effect, PolicyEngine, PolicyRule, ACTION_WILDCARD,
};

pub const TARGET_AI_INPUT: &str = "ai.input";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallFlag {
    InstructionOverride,
    SystemPromptLeak,
    ToolCallInjection,
    RoleManipulation,
    DelimiterInjection,
    SecretPattern,
    UrlExfiltration,
    EncodedPayload,
    OversizedInput,
}

impl FirewallFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InstructionOverride => "instruction_override",
            Self::SystemPromptLeak => "system_prompt_leak",
            Self::ToolCallInjection => "tool_call_injection",
            Self::RoleManipulation => "role_manipulation",
            Self::DelimiterInjection => "delimiter_injection",
            Self::SecretPattern => "secret_pattern",
            Self::UrlExfiltration => "url_exfiltration",
            Self::EncodedPayload => "encoded_payload",
            Self::OversizedInput => "oversized_input",
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            Self::InstructionOverride => 0.6,
            Self::ToolCallInjection => 0.5,
            Self::SystemPromptLeak | Self::SecretPattern | Self::UrlExfiltration => 0.4,
            Self::RoleManipulation
            | Self::DelimiterInjection
            | Self::EncodedPayload
            | Self::OversizedInput => 0.3,
        }
    }

    fn is_injection(&self) -> bool {
        matches!(
            self,
            Self::InstructionOverride
                | Self::SystemPromptLeak
                | Self::ToolCallInjection
                | Self::RoleManipulation
                | Self::DelimiterInjection
        )
    }
}

/// Security event type for a set of flags, most severe class first.
pub fn event_type_for(flags: &[FirewallFlag]) -> &'static str {
    if flags.iter().any(FirewallFlag::is_injection) {
        "prompt_injection"
    } else if flags.contains(&FirewallFlag::SecretPattern) {
        "secret_exposure"
    } else if flags.contains(&FirewallFlag::UrlExfiltration) {
        "data_exfiltration"
    } else if flags.contains(&FirewallFlag::EncodedPayload) {
        "encoded_payload"
    } else if flags.contains(&FirewallFlag::OversizedInput) {
        "oversized_input"
    } else {
        "input_scanned"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSource {
    UserMessage,
    TicketContent,
    RetrievedChunk,
    ToolOutput,
}

impl InputSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::TicketContent => "ticket_content",
            Self::RetrievedChunk => "retrieved_chunk",
            Self::ToolOutput => "tool_output",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallDecision {
    Allow,
    Sanitize,
    Block,
}

impl FirewallDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Sanitize => "sanitize",
            Self::Block => "block",
        }
    }

    fn from_effect(effect: Effect) -> Self {
        match effect {
            Effect::Deny => Self::Block,
            Effect::Review => Self::Sanitize,
            Effect::Allow => Self::Allow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagSpan {
    pub start: usize,
    pub end: usize,
    pub flag: FirewallFlag,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub risk_score: f64,
    pub flags: Vec<FirewallFlag>,
    pub spans: Vec<FlagSpan>,
}

impl ScanReport {
    pub fn flag_names(&self) -> Vec<&'static str> {
        self.flags.iter().map(FirewallFlag::as_str).collect()
    }

    fn match_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for span in &self.spans {
            *counts.entry(span.flag.as_str()).or_insert(0) += 1;
        }
        counts
    }
}

/// Text headed for a prompt, with what the firewall needs to know about it.
#[derive(Debug, Clone)]
pub struct InspectRequest<'a> {
    pub feature: &'a str,
    pub source: InputSource,
    pub ticket_id: Option<Uuid>,
    pub text: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inspection {
    pub decision: FirewallDecision,
    pub risk_score: f64,
    pub flags: Vec<FirewallFlag>,
    pub event_id: Option<Uuid>,
    pub snippet_hash: String,
    pub policy: Option<Decision>,
    /// Text to place in the prompt. `None` when blocked.
    pub text: Option<String>,
}

impl Inspection {
    pub fn is_blocked(&self) -> bool {
        self.decision == FirewallDecision::Block
    }

    /// `PromptBlocked` for a blocked input, the prompt text otherwise.
    pub fn into_text(self) -> Result<String, GovernanceError> {
        match self.text {
            Some(text) if !self.is_blocked() => Ok(text),
            _ => Err(GovernanceError::PromptBlocked {
                risk_score: self.risk_score,
                flags: self.flags.iter().map(|f| f.as_str().to_string()).collect(),
            }),
        }
    }
}

pub struct PromptFirewall {
    config: FirewallConfig,
    detectors: Vec<(Regex, FirewallFlag)>,
}

impl PromptFirewall {
    pub fn new(config: FirewallConfig) -> Result<Self, GovernanceError> {
        let detectors = Self::build_detectors(config.base64_min_len)?;
        Ok(Self { config, detectors })
    }

    pub fn with_defaults() -> Result<Self, GovernanceError> {
        Self::new(FirewallConfig::default())
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    fn build_detectors(base64_min_len: usize) -> Result<Vec<(Regex, FirewallFlag)>, GovernanceError> {
        let encoded = format!(r"[A-Za-z0-9+/]{{{},}}={{0,2}}", base64_min_len.max(16));
        let patterns: Vec<(&str, FirewallFlag)> = vec![
            (r"(?i)ignore\s+(all\s+)?(the\s+)?(previous|prior|above|earlier)\s+(instructions?|prompts?|rules?|directions?)", FirewallFlag::InstructionOverride),
            (r"(?i)disregard\s+(all\s+)?(the\s+)?(previous|prior|above|your)\s+\w+", FirewallFlag::InstructionOverride),
            (r"(?i)forget\s+(everything|all|your)\s+(you\s+were\s+told|instructions?|rules?|training)", FirewallFlag::InstructionOverride),
            (r"(?i)(new|updated)\s+instructions?\s*:", FirewallFlag::InstructionOverride),
            (r"(?i)override\s+(your|the|all)\s+(instructions?|rules?|guidelines?)", FirewallFlag::InstructionOverride),
            (r"(?i)(reveal|show|tell|display|output|print|leak)\s+(me\s+)?(your|the)\s+(system\s+|hidden\s+|initial\s+)?(prompt|instructions?)", FirewallFlag::SystemPromptLeak),
            (r"(?i)what\s+(are|were)\s+your\s+(initial|original|system|hidden)\s+(instructions?|prompts?)", FirewallFlag::SystemPromptLeak),
            (r"(?i)repeat\s+(your|the)\s+(system\s+)?(prompt|instructions?)", FirewallFlag::SystemPromptLeak),
            (r#"(?i)"?(tool_calls?|function_call|tool_use)"?\s*[:=(]"#, FirewallFlag::ToolCallInjection),
            (r"(?i)<\s*/?\s*(tool|function)(_call|_use)?\s*>", FirewallFlag::ToolCallInjection),
            (r"(?i)\b(call|invoke|execute|run)\s+(the\s+)?(tool|function)\s+[\w.]+", FirewallFlag::ToolCallInjection),
            (r"(?i)system\s*:\s*you\s+are", FirewallFlag::RoleManipulation),
            (r"(?i)you\s+are\s+now\s+(a|an|the)\s+", FirewallFlag::RoleManipulation),
            (r"(?i)pretend\s+(you('re|\s+are)|to\s+be)\s+", FirewallFlag::RoleManipulation),
            (r"(?i)(developer|god|admin|dan)\s+mode|do\s+anything\s+now", FirewallFlag::RoleManipulation),
            (r"(?i)(\[|\{|<)/?system(\]|\}|>)", FirewallFlag::DelimiterInjection),
            (r"(?i)```(system|assistant)", FirewallFlag::DelimiterInjection),
            (r"<\|im_(start|end)\|>|<\|endoftext\|>", FirewallFlag::DelimiterInjection),
            (r"\bsk-(proj-|live-|test-)?[A-Za-z0-9_\-]{20,}", FirewallFlag::SecretPattern),
            (r"\b(AKIA|ASIA)[0-9A-Z]{16}\b", FirewallFlag::SecretPattern),
            (r"\bgh[pousr]_[A-Za-z0-9]{36,}", FirewallFlag::SecretPattern),
            (r"\bxox[abprs]-[A-Za-z0-9\-]{10,}", FirewallFlag::SecretPattern),
            (r"\bAIza[0-9A-Za-z_\-]{35}", FirewallFlag::SecretPattern),
            (r"-----BEGIN [A-Z ]*PRIVATE KEY-----", FirewallFlag::SecretPattern),
            (r#"(?i)(api[_\-]?key|secret[_\-]?key|password|passwd|token)\s*[:=]\s*['"]?[^\s'"]{8,}"#, FirewallFlag::SecretPattern),
            (r"(?i)(send|post|upload|forward|exfiltrate|transmit|leak)\b[^\n]{0,80}?https?://\S+", FirewallFlag::UrlExfiltration),
            (r"(?i)!\[[^\]]*\]\(https?://[^)\s]*\?[^)\s]*=[^)\s]*\)", FirewallFlag::UrlExfiltration),
            (r"(?i)https?://\S+[?&](data|secret|token|key|payload|exfil)=", FirewallFlag::UrlExfiltration),
            (encoded.as_str(), FirewallFlag::EncodedPayload),
        ];

        let mut compiled = Vec::with_capacity(patterns.len());
        for (pattern, flag) in patterns {
            let regex = Regex::new(pattern).map_err(|e| {
                GovernanceError::Validation(format!("invalid {} pattern: {e}", flag.as_str()))
            })?;
            compiled.push((regex, flag));
        }
        Ok(compiled)
    }

    /// Detector pass only; no policy, no side effects.
    pub fn scan(&self, text: &str) -> ScanReport {
        let mut spans = Vec::new();
        let scanned = if text.len() > self.config.max_input_length {
            spans.push(FlagSpan {
                start: 0,
                end: 0,
                flag: FirewallFlag::OversizedInput,
            });
            truncate_at_boundary(text, self.config.max_input_length)
        } else {
            text
        };

        for (regex, flag) in &self.detectors {
            for m in regex.find_iter(scanned) {
                spans.push(FlagSpan {
                    start: m.start(),
                    end: m.end(),
                    flag: *flag,
                });
            }
        }

        let mut flags: Vec<FirewallFlag> = spans.iter().map(|s| s.flag).collect();
        flags.sort();
        flags.dedup();
        let risk_score = flags.iter().map(FirewallFlag::weight).sum::<f64>().clamp(0.0, 1.0);

        ScanReport {
            risk_score,
            flags,
            spans,
        }
    }

    /// Replaces every flagged span with `[REDACTED:<flag>]`. Overlapping
    /// spans collapse into the first one.
    pub fn sanitize(&self, text: &str, report: &ScanReport) -> String {
        let scanned = truncate_at_boundary(text, self.config.max_input_length);
        let mut spans: Vec<FlagSpan> = report
            .spans
            .iter()
            .filter(|s| s.end > s.start && s.end <= scanned.len())
            .copied()
            .collect();
        spans.sort_by_key(|s| (s.start, std::cmp::Reverse(s.end)));

        let mut out = String::with_capacity(scanned.len());
        let mut cursor = 0;
        for span in spans {
            if span.start < cursor {
                continue;
            }
            out.push_str(&scanned[cursor..span.start]);
            out.push_str(&format!("[REDACTED:{}]", span.flag.as_str()));
            cursor = span.end;
        }
        out.push_str(&scanned[cursor..]);
        out
    }

    /// Scans `request.text`, consults policy and records the security event
    /// on its own unit of work, so the trail survives whatever the caller
    /// does next.
    pub fn inspect(
        &self,
        gateway: &TenantGateway,
        policy: &PolicyEngine,
        ctx: &SessionContext,
        request: &InspectRequest<'_>,
    ) -> Result<Inspection, GovernanceError> {
        let snippet_hash = snippet_hash(request.text);
        let mut uow = gateway.enter(ctx)?;

        // Disabled: no detectors, no policy, but the event is still written.
        let (report, policy_decision) = if self.config.enabled {
            let report = self.scan(request.text);
            let decision_request = DecisionRequest::new(TARGET_AI_INPUT, request.feature, ctx)
                .with("risk_score", report.risk_score)
                .with("flags", json!(report.flag_names()))
                .with("flag_count", report.flags.len())
                .with("source", request.source.as_str());
            let policy_decision = policy.evaluate(uow.read(), &decision_request)?;
            (report, Some(policy_decision))
        } else {
            (ScanReport::default(), None)
        };
        let decision = policy_decision
            .as_ref()
            .map_or(FirewallDecision::Allow, |d| FirewallDecision::from_effect(d.effect));

        let event = AiSecurityEvent {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            user_id: Some(ctx.user_id),
            ticket_id: request.ticket_id,
            event_type: event_type_for(&report.flags).to_string(),
            risk_score: report.risk_score,
            flags: json!({
                "flags": report.flag_names(),
                "matches": report.match_counts(),
                "source": request.source.as_str(),
                "feature": request.feature,
                "decision": decision.as_str(),
                "rule": policy_decision.as_ref().and_then(|d| d.rule_name.clone()),
                "scanned": self.config.enabled,
            }),
            snippet_hash: snippet_hash.clone(),
            created_at: Utc::now(),
        };
        uow.write()?.insert_security_event(&event)?;
        uow.commit()?;

        if decision == FirewallDecision::Block {
            warn!(
                org_id = %ctx.organization_id,
                user_id = %ctx.user_id,
                feature = request.feature,
                risk = report.risk_score,
                flags = ?report.flag_names(),
                snippet_hash = %snippet_hash,
                "Prompt blocked"
            );
        } else if !report.flags.is_empty() {
            info!(
                feature = request.feature,
                risk = report.risk_score,
                decision = decision.as_str(),
                "Prompt input flagged"
            );
        }

        let text = match decision {
            FirewallDecision::Block => None,
            FirewallDecision::Sanitize => Some(self.sanitize(request.text, &report)),
            FirewallDecision::Allow if self.config.enabled => Some(
                truncate_at_boundary(request.text, self.config.max_input_length).to_string(),
            ),
            FirewallDecision::Allow => Some(request.text.to_string()),
        };

        Ok(Inspection {
            decision,
            risk_score: report.risk_score,
            flags: report.flags,
            event_id: Some(event.id),
            snippet_hash,
            policy: policy_decision,
            text,
        })
    }
}

fn truncate_at_boundary(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Lowercased, whitespace collapsed, trimmed.
pub fn normalize_snippet(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn snippet_hash(text: &str) -> String {
    hex::encode(Sha256::digest(normalize_snippet(text).as_bytes()))
}

/// Global rules applied after every stored rule: block high-risk input,
/// send elevated-risk input through sanitisation.
pub fn baseline_rules(config: &FirewallConfig) -> Vec<PolicyRule> {
    let epoch: DateTime<Utc> = DateTime::UNIX_EPOCH;
    let rule = |id: u128, name: &str, threshold: f64, effect: Effect, priority: i32| PolicyRule {
        id: Uuid::from_u128(id),
        organization_id: None,
        name: name.to_string(),
        description: Some(format!("risk_score >= {threshold}")),
        target: TARGET_AI_INPUT.to_string(),
        action: ACTION_WILDCARD.to_string(),
        effect,
        condition: Condition::ge("risk_score", threshold),
        priority,
        enabled: true,
        created_by: None,
        created_at: epoch,
        updated_at: epoch,
    };
    vec![
        rule(1, "baseline-block-high-risk", config.block_threshold, Effect::Deny, 10_000),
        rule(2, "baseline-review-elevated-risk", config.review_threshold, Effect::Review, 10_001),
    ]
}
