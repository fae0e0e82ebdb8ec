//! Copilot runs: plan, call tools under policy, answer.
//!
//! A run row is committed `pending` before any model call and moves to `ok`
//! or `failed` exactly once. Cancelling the token, or dropping the future,
//! fails the run with `cancelled`.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::error::GovernanceError;
use crate::core::gateway::{blocking, TenantGateway};
use crate::core::session::{ContextSnapshot, SessionContext};
use crate::core::shared::models::{CopilotRun, RunCompletion, RunStatus};
use crate::llm::governed::{AiGovernor, Surfaced};
use crate::llm::provenance::{Evidence, ProvenanceEntry};
use crate::security::policy::{Decision, DecisionRequest};
use crate::security::prompt_firewall::InputSource;

pub const ANSWER_TEMPLATE_ID: &str = "copilot-answer-v1";
const DEFAULT_MAX_STEPS: usize = 8;

#[async_trait]
pub trait CopilotTool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, ctx: &SessionContext, input: &Value) -> Result<Value, GovernanceError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub tool: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CopilotPlan {
    #[serde(default)]
    pub steps: Vec<PlannedCall>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Plans come back as JSON, sometimes fenced. Anything else is a plan with
/// no tool calls.
pub fn parse_plan(raw: &str) -> CopilotPlan {
    let trimmed = raw.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if end > start => &trimmed[start..=end],
        _ => return CopilotPlan::default(),
    };
    serde_json::from_str(body).unwrap_or_default()
}

#[derive(Debug, Clone, Deserialize)]
pub struct CopilotRequest {
    #[serde(default)]
    pub ticket_id: Option<Uuid>,
    pub instruction: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopilotAnswer {
    pub run_id: Uuid,
    pub text: String,
    pub tool_trace: Vec<Value>,
}

#[derive(Debug, Default)]
struct RunState {
    plan: Option<Value>,
    trace: Vec<Value>,
    risk_score: f64,
    input_events: Vec<Uuid>,
    review_required: bool,
}

struct Executed {
    answer: String,
    decision: Decision,
}

fn finish_run(
    gateway: &TenantGateway,
    snapshot: &ContextSnapshot,
    run_id: Uuid,
    completion: &RunCompletion,
) -> Result<bool, GovernanceError> {
    let mut uow = gateway.enter_snapshot(snapshot)?;
    let finished = uow.write()?.finish_copilot_run(run_id, completion)?;
    uow.commit()?;
    Ok(finished)
}

/// Fails a pending run if nothing finished it first.
struct RunGuard {
    gateway: TenantGateway,
    snapshot: ContextSnapshot,
    run_id: Uuid,
    started: Instant,
    done: bool,
}

impl RunGuard {
    fn completion(
        &self,
        status: RunStatus,
        state: &RunState,
        output: Option<String>,
        error: Option<String>,
    ) -> RunCompletion {
        RunCompletion {
            status,
            plan: state.plan.clone(),
            tool_trace: Value::Array(state.trace.clone()),
            output,
            latency_ms: self.started.elapsed().as_millis() as i64,
            error,
            completed_at: Utc::now(),
        }
    }

    async fn finish(&mut self, completion: RunCompletion) -> Result<bool, GovernanceError> {
        self.done = true;
        let gateway = self.gateway.clone();
        let snapshot = self.snapshot.clone();
        let run_id = self.run_id;
        blocking(move || finish_run(&gateway, &snapshot, run_id, &completion)).await
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let completion = RunCompletion {
            status: RunStatus::Failed,
            plan: None,
            tool_trace: Value::Array(Vec::new()),
            output: None,
            latency_ms: self.started.elapsed().as_millis() as i64,
            error: Some("cancelled".to_string()),
            completed_at: Utc::now(),
        };
        let gateway = self.gateway.clone();
        let snapshot = self.snapshot.clone();
        let run_id = self.run_id;
        let finish = move || {
            if let Err(e) = finish_run(&gateway, &snapshot, run_id, &completion) {
                error!(run_id = %run_id, "Could not fail abandoned copilot run: {}", e);
            }
        };
        warn!(run_id = %self.run_id, "Copilot run abandoned");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(finish);
            }
            Err(_) => finish(),
        }
    }
}

pub struct Copilot {
    governor: AiGovernor,
    tools: BTreeMap<String, Arc<dyn CopilotTool>>,
    max_steps: usize,
}

impl Copilot {
    pub fn new(governor: AiGovernor) -> Self {
        Self {
            governor,
            tools: BTreeMap::new(),
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    pub fn with_tool(mut self, tool: Arc<dyn CopilotTool>) -> Self {
        self.tools.insert(tool.name().to_string(), tool);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub async fn run(
        &self,
        ctx: &SessionContext,
        request: CopilotRequest,
        cancel: CancellationToken,
    ) -> Result<Surfaced<CopilotAnswer>, GovernanceError> {
        let gateway = self.governor.gateway().clone();
        let run = CopilotRun {
            id: Uuid::new_v4(),
            organization_id: ctx.organization_id,
            ticket_id: request.ticket_id,
            user_id: ctx.user_id,
            plan: None,
            tool_trace: Value::Array(Vec::new()),
            output: None,
            model_id: self.governor.model_id().to_string(),
            latency_ms: None,
            status: RunStatus::Pending,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let run_id = run.id;
        {
            let gateway = gateway.clone();
            let ctx = ctx.clone();
            blocking(move || {
                let mut uow = gateway.enter(&ctx)?;
                uow.write()?.insert_copilot_run(&run)?;
                uow.commit().map(|_| ())
            })
            .await?;
        }

        let mut guard = RunGuard {
            gateway,
            snapshot: ctx.snapshot().for_background(),
            run_id,
            started: Instant::now(),
            done: false,
        };
        let mut state = RunState::default();

        let executed = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GovernanceError::Cancelled),
            result = self.execute(ctx, &request, &mut state) => result,
        };

        let executed = match executed {
            Ok(executed) => executed,
            Err(e) => {
                let reason = match &e {
                    GovernanceError::Cancelled => "cancelled".to_string(),
                    other => other.to_string(),
                };
                let completion = guard.completion(RunStatus::Failed, &state, None, Some(reason));
                guard.finish(completion).await?;
                warn!(run_id = %run_id, kind = e.kind(), "Copilot run failed");
                return Err(e);
            }
        };

        let answer = CopilotAnswer {
            run_id,
            text: executed.answer.trim().to_string(),
            tool_trace: state.trace.clone(),
        };
        let mut evidence = Evidence::new(self.governor.model_id(), ANSWER_TEMPLATE_ID)
            .with_output(&answer.text);
        for event in &state.input_events {
            evidence = evidence.with_input_event(Some(*event));
        }
        for call in &state.trace {
            evidence = evidence.with_tool(call.clone());
        }
        let entry = ProvenanceEntry {
            feature: "copilot".into(),
            ticket_id: request.ticket_id,
            evidence,
            confidence: if state.review_required { 0.5 } else { 0.8 },
            risk_score: state.risk_score,
            decision: executed.decision,
        };

        let surfaced = match self.governor.surface(ctx, entry, answer).await {
            Ok(surfaced) => surfaced,
            Err(e) => {
                let completion =
                    guard.completion(RunStatus::Failed, &state, None, Some(e.kind().to_string()));
                guard.finish(completion).await?;
                return Err(e);
            }
        };

        let completion = guard.completion(
            RunStatus::Ok,
            &state,
            Some(surfaced.value().text.clone()),
            None,
        );
        if !guard.finish(completion).await? {
            return Err(GovernanceError::Validation(format!(
                "copilot run {run_id} was already finished"
            )));
        }
        info!(
            run_id = %run_id,
            tools = state.trace.len(),
            provenance_id = %surfaced.provenance_id(),
            "Copilot run finished"
        );

        Ok(if state.review_required {
            surfaced.flag_for_review()
        } else {
            surfaced
        })
    }

    async fn execute(
        &self,
        ctx: &SessionContext,
        request: &CopilotRequest,
        state: &mut RunState,
    ) -> Result<Executed, GovernanceError> {
        let governor = &self.governor;
        let ticket_id = request.ticket_id;

        let inspection = governor
            .inspect(ctx, "copilot", InputSource::UserMessage, ticket_id, &request.instruction)
            .await?;
        state.risk_score = inspection.risk_score;
        state.input_events.extend(inspection.event_id);
        let instruction = inspection.into_text()?;

        let plan_raw = governor.complete(&self.plan_prompt(&instruction)).await?;
        let plan = parse_plan(&plan_raw);
        state.plan = serde_json::to_value(&plan).ok();
        if plan.steps.len() > self.max_steps {
            return Err(GovernanceError::Validation(format!(
                "plan has {} steps, limit is {}",
                plan.steps.len(),
                self.max_steps
            )));
        }

        let mut results = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let tool = self.tools.get(&step.tool).ok_or_else(|| {
                GovernanceError::Validation(format!("unknown tool '{}'", step.tool))
            })?;

            let decision_request = DecisionRequest::new("copilot.tool", &step.tool, ctx)
                .with("risk_score", state.risk_score)
                .with("ticket_id", json!(ticket_id))
                .with("input", step.input.clone());
            let decision = match governor.enforce(decision_request).await {
                Ok(decision) => decision,
                Err(e) => {
                    state.trace.push(json!({
                        "tool": step.tool,
                        "input": step.input,
                        "status": "denied",
                        "error": e.to_string(),
                    }));
                    return Err(e);
                }
            };
            state.review_required |= decision.review_required();

            let output = match tool.invoke(ctx, &step.input).await {
                Ok(output) => output,
                Err(e) => {
                    state.trace.push(json!({
                        "tool": step.tool,
                        "input": step.input,
                        "status": "error",
                        "error": e.to_string(),
                    }));
                    return Err(e);
                }
            };
            state.trace.push(json!({
                "tool": step.tool,
                "input": step.input,
                "status": "ok",
                "decision": decision.effect.as_str(),
                "output": output,
            }));

            let rendered = output.to_string();
            let checked = governor
                .inspect(ctx, "copilot", InputSource::ToolOutput, ticket_id, &rendered)
                .await?;
            state.input_events.extend(checked.event_id);
            state.risk_score = state.risk_score.max(checked.risk_score);
            results.push((step.tool.clone(), checked.into_text()?));
        }

        let answer = governor.complete(&answer_prompt(&instruction, &results)).await?;
        let decision = governor
            .enforce(
                DecisionRequest::new("ai.reply", "copilot", ctx)
                    .with("risk_score", state.risk_score)
                    .with("tool_count", results.len()),
            )
            .await?;
        state.review_required |= decision.review_required();

        Ok(Executed { answer, decision })
    }

    fn plan_prompt(&self, instruction: &str) -> String {
        format!(
            "You are a help-desk copilot. Available tools: {}.\n\
             Reply with JSON {{\"steps\": [{{\"tool\": <name>, \"input\": <object>}}], \"rationale\": <text>}}. \
             Use an empty list when no tool is needed.\n\nRequest:\n{instruction}",
            self.tool_names().join(", ")
        )
    }
}

fn answer_prompt(instruction: &str, results: &[(String, String)]) -> String {
    let mut prompt = String::from("Answer the agent's request using the tool results below.\n\n");
    for (tool, output) in results {
        prompt.push_str(&format!("[{tool}]\n{output}\n\n"));
    }
    prompt.push_str("Request:\n");
    prompt.push_str(instruction);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{FirewallConfig, LlmConfig, PolicyConfig};
    use crate::core::session::Role;
    use crate::core::store::MemoryDatabase;
    use crate::llm::LLMProvider;
    use crate::security::audit::AuditRecorder;
    use crate::security::policy::{Effect, PolicyEngine, RuleDraft};
    use crate::security::prompt_firewall::{baseline_rules, PromptFirewall};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    struct QueuedLlm {
        answers: Mutex<VecDeque<String>>,
        delay: Duration,
    }

    impl QueuedLlm {
        fn new(answers: &[&str]) -> Self {
            Self {
                answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl LLMProvider for QueuedLlm {
        fn model_id(&self) -> &str {
            "queued"
        }

        async fn generate(&self, _prompt: &str, _config: &Value) -> Result<String, GovernanceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.answers
                .lock()
                .ok()
                .and_then(|mut answers| answers.pop_front())
                .ok_or_else(|| GovernanceError::Llm("no scripted answer left".into()))
        }
    }

    struct TicketLookup;

    #[async_trait]
    impl CopilotTool for TicketLookup {
        fn name(&self) -> &str {
            "lookup_ticket"
        }

        async fn invoke(&self, _ctx: &SessionContext, input: &Value) -> Result<Value, GovernanceError> {
            Ok(json!({"id": input["id"], "status": "open", "subject": "VPN drops"}))
        }
    }

    struct Fixture {
        db: MemoryDatabase,
        gateway: TenantGateway,
        policy: Arc<PolicyEngine>,
        ctx: SessionContext,
    }

    fn fixture() -> Fixture {
        let db = MemoryDatabase::new();
        let gateway = TenantGateway::in_memory(&db, 4, Duration::from_millis(200)).expect("gateway");
        let policy = Arc::new(
            PolicyEngine::new(&PolicyConfig::default())
                .with_baseline(baseline_rules(&FirewallConfig::default())),
        );
        let ctx = SessionContext::new(Uuid::new_v4(), Uuid::new_v4(), Role::Agent);
        Fixture {
            db,
            gateway,
            policy,
            ctx,
        }
    }

    fn copilot(fx: &Fixture, llm: QueuedLlm) -> Copilot {
        let governor = AiGovernor::new(
            fx.gateway.clone(),
            Arc::clone(&fx.policy),
            Arc::new(PromptFirewall::with_defaults().expect("firewall")),
            Arc::new(llm),
            LlmConfig::default(),
        );
        Copilot::new(governor).with_tool(Arc::new(TicketLookup))
    }

    fn allow_lookup(fx: &Fixture) {
        let admin = SessionContext::new(fx.ctx.organization_id, Uuid::new_v4(), Role::Admin);
        let audit = AuditRecorder::new();
        let mut uow = fx.gateway.enter(&admin).expect("enter");
        fx.policy
            .create_rule(
                &mut uow,
                &audit,
                RuleDraft::new("lookup-allowed", "copilot.tool", "lookup_ticket", Effect::Allow),
            )
            .expect("rule");
        audit.commit(uow).expect("commit");
    }

    fn stored_run(fx: &Fixture) -> CopilotRun {
        let mut conn = fx.gateway.acquire(Some(&fx.ctx)).expect("acquire");
        let mut runs = conn.read().copilot_runs(None).expect("runs");
        assert_eq!(runs.len(), 1);
        runs.remove(0)
    }

    #[test]
    fn test_parse_plan() {
        let plan = parse_plan(
            "```json\n{\"steps\": [{\"tool\": \"lookup_ticket\", \"input\": {\"id\": 7}}]}\n```",
        );
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].input["id"], 7);
        assert!(parse_plan("no tools needed").steps.is_empty());
    }

    #[tokio::test]
    async fn test_tools_denied_by_default() {
        let fx = fixture();
        let copilot = copilot(
            &fx,
            QueuedLlm::new(&[r#"{"steps": [{"tool": "lookup_ticket", "input": {"id": 1}}]}"#, "unused"]),
        );
        let err = copilot
            .run(
                &fx.ctx,
                CopilotRequest {
                    ticket_id: None,
                    instruction: "Summarise ticket 1".into(),
                },
                CancellationToken::new(),
            )
            .await
            .expect_err("denied");
        assert!(matches!(err, GovernanceError::PolicyDeny { .. }));

        let run = stored_run(&fx);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.tool_trace[0]["status"], "denied");
        assert_eq!(fx.db.row_count("ai_provenance"), 0);
    }

    #[tokio::test]
    async fn test_allowed_tool_run_completes() {
        let fx = fixture();
        allow_lookup(&fx);
        let copilot = copilot(
            &fx,
            QueuedLlm::new(&[
                r#"{"steps": [{"tool": "lookup_ticket", "input": {"id": 1}}], "rationale": "need status"}"#,
                "Ticket 1 is still open.",
            ]),
        );
        let answer = copilot
            .run(
                &fx.ctx,
                CopilotRequest {
                    ticket_id: None,
                    instruction: "What is the status of ticket 1?".into(),
                },
                CancellationToken::new(),
            )
            .await
            .expect("run");
        assert_eq!(answer.value().text, "Ticket 1 is still open.");
        assert_eq!(answer.value().tool_trace.len(), 1);

        let run = stored_run(&fx);
        assert_eq!(run.id, answer.value().run_id);
        assert_eq!(run.status, RunStatus::Ok);
        assert_eq!(run.output.as_deref(), Some("Ticket 1 is still open."));
        assert!(run.completed_at.is_some());
        assert_eq!(fx.db.row_count("ai_provenance"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_fails_run() {
        let fx = fixture();
        let mut llm = QueuedLlm::new(&["{}", "unused"]);
        llm.delay = Duration::from_secs(10);
        let copilot = copilot(&fx, llm);
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = copilot
            .run(
                &fx.ctx,
                CopilotRequest {
                    ticket_id: None,
                    instruction: "Draft a summary".into(),
                },
                token,
            )
            .await
            .expect_err("cancelled");
        assert!(matches!(err, GovernanceError::Cancelled));

        let run = stored_run(&fx);
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("cancelled"));
    }
}
