use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::core::error::GovernanceError;
use crate::core::gateway::TenantGateway;
use crate::llm::copilot::Copilot;
use crate::llm::governed::AiGovernor;
use crate::llm::{LLMProvider, OpenAIClient};
use crate::security::audit::AuditRecorder;
use crate::security::policy::PolicyEngine;
use crate::security::prompt_firewall::{baseline_rules, PromptFirewall};
use crate::security::webhook::{
    Notifier, ReqwestTransport, TracingNotifier, WebhookDispatcher, WebhookTransport,
};
use crate::tickets::TicketLookupTool;

/// Everything a request handler may touch, built once at startup.
pub struct AppState {
    pub config: AppConfig,
    pub gateway: TenantGateway,
    pub policy: Arc<PolicyEngine>,
    pub firewall: Arc<PromptFirewall>,
    pub audit: AuditRecorder,
    pub dispatcher: Arc<WebhookDispatcher>,
    /// Absent when no model endpoint is configured; AI routes answer 404.
    pub governor: Option<AiGovernor>,
    pub copilot: Option<Arc<Copilot>>,
}

pub struct AppStateBuilder {
    config: AppConfig,
    gateway: TenantGateway,
    transport: Option<Arc<dyn WebhookTransport>>,
    notifier: Arc<dyn Notifier>,
    llm: Option<Arc<dyn LLMProvider>>,
}

impl AppStateBuilder {
    pub fn new(config: AppConfig, gateway: TenantGateway) -> Self {
        let llm = OpenAIClient::from_config(&config.llm).map(|c| Arc::new(c) as Arc<dyn LLMProvider>);
        Self {
            config,
            gateway,
            transport: None,
            notifier: Arc::new(TracingNotifier),
            llm,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LLMProvider>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn build(self) -> Result<AppState, GovernanceError> {
        let config = self.config;
        let firewall = Arc::new(PromptFirewall::new(config.firewall.clone())?);
        let policy = Arc::new(
            PolicyEngine::new(&config.policy).with_baseline(baseline_rules(&config.firewall)),
        );

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let dispatcher = Arc::new(
            WebhookDispatcher::new(self.gateway.clone(), transport, config.webhook.clone())
                .with_notifier(self.notifier),
        );
        let audit = AuditRecorder::new().with_dispatcher(Arc::clone(&dispatcher));

        let governor = self.llm.map(|llm| {
            AiGovernor::new(
                self.gateway.clone(),
                Arc::clone(&policy),
                Arc::clone(&firewall),
                llm,
                config.llm.clone(),
            )
        });
        let copilot = governor.clone().map(|governor| {
            Arc::new(
                Copilot::new(governor)
                    .with_tool(Arc::new(TicketLookupTool::new(self.gateway.clone()))),
            )
        });

        Ok(AppState {
            config,
            gateway: self.gateway,
            policy,
            firewall,
            audit,
            dispatcher,
            governor,
            copilot,
        })
    }
}
