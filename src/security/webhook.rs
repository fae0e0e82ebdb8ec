//! Outbound event fan-out.
//!
//! Committed domain events are POSTed to every enabled webhook of the tenant
//! that subscribes to them. Bodies are signed with HMAC-SHA256 over the raw
//! JSON, retried with jittered exponential backoff, and each delivery leaves
//! a `webhook_deliveries` row. Delivery is at-least-once; the delivery id in
//! the payload is stable across retries.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::config::WebhookConfig;
use crate::core::error::GovernanceError;
use crate::core::events::{DomainEvent, EventName};
use crate::core::gateway::{blocking, TenantGateway, UnitOfWork};
use crate::core::session::ContextSnapshot;
use crate::core::shared::models::{Webhook, WebhookDelivery};
use crate::core::store::StoreError;
use crate::security::audit::{AuditEntry, AuditRecorder, REDACTED};
use crate::security::policy::{DecisionRequest, PolicyEngine};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";
pub const DELIVERY_ID_HEADER: &str = "X-Delivery-Id";
const SIGNATURE_SCHEME: &str = "sha256";
const SECRET_PREFIX: &str = "whsec_";

/// One signed POST, identical across retries apart from the timestamp.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub url: String,
    pub body: String,
    pub headers: Vec<(&'static str, String)>,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// HTTP seam. Returns the response status, or a transport error message.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &OutboundRequest, timeout: Duration) -> Result<u16, String>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, GovernanceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("helpdesk-webhooks/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GovernanceError::WebhookTransportFailed(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for ReqwestTransport {
    async fn post(&self, request: &OutboundRequest, timeout: Duration) -> Result<u16, String> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }
        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

/// Told when a webhook is switched off after repeated failures.
pub trait Notifier: Send + Sync {
    fn webhook_disabled(&self, webhook: &Webhook, failure_count: i32, reason: &str);
}

/// Logs the disable at `warn`.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn webhook_disabled(&self, webhook: &Webhook, failure_count: i32, reason: &str) {
        warn!(
            org_id = %webhook.organization_id,
            webhook_id = %webhook.id,
            failure_count,
            "Webhook disabled: {}",
            reason
        );
    }
}

/// `sha256=<hex HMAC-SHA256(secret, body)>`
pub fn sign_payload(secret: &str, body: &str) -> Result<String, GovernanceError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| GovernanceError::Validation(format!("webhook secret: {e}")))?;
    mac.update(body.as_bytes());
    Ok(format!(
        "{SIGNATURE_SCHEME}={}",
        hex::encode(mac.finalize().into_bytes())
    ))
}

pub fn verify_signature(secret: &str, body: &str, header: &str) -> bool {
    match sign_payload(secret, body) {
        Ok(expected) => constant_time_compare(header, &expected),
        Err(_) => false,
    }
}

pub fn parse_signature_header(header: &str) -> Option<(&str, &str)> {
    header.split_once('=').filter(|(scheme, sig)| !scheme.is_empty() && !sig.is_empty())
}

fn generate_webhook_secret() -> String {
    let mut rng = rand::rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.random()).collect();
    format!("{SECRET_PREFIX}{}", BASE64.encode(&bytes))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Rejects non-HTTP schemes, plain HTTP when HTTPS is required, and hosts
/// that resolve to this machine or a private network by literal address.
pub fn validate_url(url: &str, require_https: bool) -> Result<reqwest::Url, GovernanceError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| GovernanceError::Validation(format!("invalid webhook URL: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if !require_https => {}
        "http" => return Err(GovernanceError::Validation("webhook URL must use HTTPS".into())),
        other => {
            return Err(GovernanceError::Validation(format!(
                "unsupported webhook URL scheme '{other}'"
            )))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| GovernanceError::Validation("webhook URL has no host".into()))?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.eq_ignore_ascii_case("localhost") || bare.ends_with(".localhost") {
        return Err(GovernanceError::Validation(
            "webhook URL cannot point to localhost".into(),
        ));
    }
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let internal = match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if internal {
            return Err(GovernanceError::Validation(
                "webhook URL cannot point to a private address".into(),
            ));
        }
    }
    Ok(parsed)
}

/// Exponential backoff with symmetric jitter, capped.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub jitter: f64,
    pub max: Duration,
}

impl From<&WebhookConfig> for BackoffPolicy {
    fn from(config: &WebhookConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.initial_backoff_ms),
            factor: config.backoff_factor.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
            max: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay after failed attempt `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Inclusive range `delay_for(attempt)` falls in.
    pub fn bounds(&self, attempt: u32) -> (Duration, Duration) {
        let base = self.base_delay(attempt).as_secs_f64();
        let low = Duration::from_secs_f64(base * (1.0 - self.jitter));
        let high = Duration::from_secs_f64(base * (1.0 + self.jitter)).min(self.max);
        (low.min(high), high)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = if self.jitter > 0.0 {
            rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            0.0
        };
        Duration::from_secs_f64((base * (1.0 + spread)).max(0.0)).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub delivery_id: Uuid,
    pub webhook_id: Uuid,
    pub event: EventName,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_code: Option<u16>,
    pub error: Option<String>,
    /// Failure count after this delivery; zero after a success.
    pub failure_count: i32,
    pub disabled: bool,
}

/// Registration input. The secret is generated, never supplied.
#[derive(Debug, Clone, Deserialize)]
pub struct NewWebhook {
    pub url: String,
    pub event_types: Vec<String>,
}

pub struct WebhookDispatcher {
    gateway: TenantGateway,
    transport: Arc<dyn WebhookTransport>,
    config: WebhookConfig,
    backoff: BackoffPolicy,
    notifier: Option<Arc<dyn Notifier>>,
}

impl WebhookDispatcher {
    pub fn new(
        gateway: TenantGateway,
        transport: Arc<dyn WebhookTransport>,
        config: WebhookConfig,
    ) -> Self {
        let backoff = BackoffPolicy::from(&config);
        Self {
            gateway,
            transport,
            config,
            backoff,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Registers a webhook for the unit of work's tenant. Gated by the
    /// `webhook.create` policy target and audited with the secret redacted.
    /// The caller commits `uow`; the returned record carries the secret so it
    /// can be shown once.
    pub fn register(
        &self,
        uow: &mut UnitOfWork,
        policy: &PolicyEngine,
        audit: &AuditRecorder,
        request: NewWebhook,
    ) -> Result<Webhook, GovernanceError> {
        let url = validate_url(&request.url, self.config.require_https)?;
        if request.event_types.is_empty() {
            return Err(GovernanceError::Validation(
                "webhook must subscribe to at least one event".into(),
            ));
        }
        for event in &request.event_types {
            if event != "*" {
                event.parse::<EventName>().map_err(GovernanceError::Validation)?;
            }
        }

        let session = uow.session().clone();
        let decision_request = DecisionRequest::new("webhook.create", "create", &session)
            .with("url", url.as_str())
            .with("host", url.host_str().unwrap_or_default())
            .with("event_types", json!(request.event_types));
        policy.enforce(uow.read(), &decision_request)?;

        let now = Utc::now();
        let webhook = Webhook {
            id: Uuid::new_v4(),
            organization_id: session.organization_id,
            url: url.to_string(),
            secret: generate_webhook_secret(),
            event_types: request.event_types,
            enabled: true,
            failure_count: 0,
            last_triggered_at: None,
            last_failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        uow.write()?.insert_webhook(&webhook)?;

        let mut after = serde_json::to_value(&webhook).unwrap_or_else(|_| json!({}));
        if let Some(obj) = after.as_object_mut() {
            obj.insert("secret".into(), json!(webhook.secret));
        }
        audit.record(uow, AuditEntry::created("webhook", &webhook.id.to_string(), after))?;

        info!(
            org_id = %webhook.organization_id,
            webhook_id = %webhook.id,
            events = ?webhook.event_types,
            "Webhook registered"
        );
        Ok(webhook)
    }

    /// Hands `event` to a background fan-out task and returns at once. The
    /// task resolves subscribers from committed state on the blocking pool,
    /// then delivers to each on its own connection with the snapshot's org
    /// and actor, acting as `system`. `None` outside an async runtime.
    pub fn publish(
        self: &Arc<Self>,
        snapshot: &ContextSnapshot,
        event: DomainEvent,
    ) -> Option<JoinHandle<Vec<DeliveryOutcome>>> {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(event = %event.event, "No async runtime; event not delivered");
            return None;
        };
        let dispatcher = Arc::clone(self);
        let background = snapshot.for_background();
        Some(handle.spawn(async move { dispatcher.fan_out(background, event).await }))
    }

    async fn fan_out(self: Arc<Self>, snapshot: ContextSnapshot, event: DomainEvent) -> Vec<DeliveryOutcome> {
        let lookup = Arc::clone(&self);
        let lookup_snapshot = snapshot.clone();
        let event_name = event.event;
        let subscribers = match blocking(move || lookup.subscribers(&lookup_snapshot, event_name)).await {
            Ok(hooks) => hooks,
            Err(e) => {
                error!(
                    org_id = %snapshot.organization_id(),
                    event = %event.event,
                    "Webhook subscriber lookup failed: {}",
                    e
                );
                return Vec::new();
            }
        };

        let tasks: Vec<_> = subscribers
            .into_iter()
            .map(|webhook| {
                let dispatcher = Arc::clone(&self);
                let snapshot = snapshot.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    match dispatcher.deliver(&snapshot, &webhook, &event).await {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            error!(webhook_id = %webhook.id, "Webhook delivery bookkeeping failed: {}", e);
                            None
                        }
                    }
                })
            })
            .collect();

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => error!(event = %event.event, "Webhook delivery task failed: {}", e),
            }
        }
        outcomes
    }

    fn subscribers(
        &self,
        snapshot: &ContextSnapshot,
        event: EventName,
    ) -> Result<Vec<Webhook>, GovernanceError> {
        let mut conn = self.gateway.acquire(Some(snapshot.context()))?;
        Ok(conn.read().webhooks_for_event(event.as_str())?)
    }

    /// Delivers one event to one webhook with retries, then records the
    /// outcome. Returns `Err` only when bookkeeping fails.
    pub async fn deliver(
        self: &Arc<Self>,
        snapshot: &ContextSnapshot,
        webhook: &Webhook,
        event: &DomainEvent,
    ) -> Result<DeliveryOutcome, GovernanceError> {
        let delivery_id = Uuid::new_v4();
        let body = serde_json::to_string(&event.payload(delivery_id))
            .map_err(|e| GovernanceError::Validation(format!("webhook payload: {e}")))?;
        let signature = sign_payload(&webhook.secret, &body)?;
        let max_attempts = self.config.max_attempts.max(1);
        let created_at = Utc::now();

        let mut attempts = 0;
        let mut response_code = None;
        let mut last_error = None;
        let mut delivered = false;

        while attempts < max_attempts {
            attempts += 1;
            let request = OutboundRequest {
                url: webhook.url.clone(),
                body: body.clone(),
                headers: vec![
                    (SIGNATURE_HEADER, signature.clone()),
                    (TIMESTAMP_HEADER, Utc::now().timestamp().to_string()),
                    (DELIVERY_ID_HEADER, delivery_id.to_string()),
                ],
            };

            match self.transport.post(&request, self.config.timeout()).await {
                Ok(code) if (200..300).contains(&code) => {
                    response_code = Some(code);
                    last_error = None;
                    delivered = true;
                    break;
                }
                Ok(code) => {
                    response_code = Some(code);
                    last_error = Some(format!("HTTP {code}"));
                }
                Err(e) => {
                    response_code = None;
                    last_error = Some(e);
                }
            }

            debug!(
                webhook_id = %webhook.id,
                delivery_id = %delivery_id,
                attempt = attempts,
                error = last_error.as_deref().unwrap_or(""),
                "Webhook attempt failed"
            );
            if attempts < max_attempts {
                tokio::time::sleep(self.backoff.delay_for(attempts)).await;
            }
        }

        let status = if delivered {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Failed
        };
        let record = WebhookDelivery {
            id: delivery_id,
            organization_id: webhook.organization_id,
            webhook_id: webhook.id,
            event: event.event.as_str().to_string(),
            attempts: attempts as i32,
            status: status.as_str().to_string(),
            response_code: response_code.map(i32::from),
            error: last_error.clone(),
            created_at,
            completed_at: Utc::now(),
        };

        let gateway = self.gateway.clone();
        let threshold = self.config.auto_disable_threshold;
        let bookkeeping_snapshot = snapshot.clone();
        let hook = webhook.clone();
        let (failure_count, disabled) = tokio::task::spawn_blocking(move || {
            record_delivery(&gateway, &bookkeeping_snapshot, &hook, &record, threshold)
        })
        .await
        .map_err(|e| GovernanceError::Store(StoreError::Connection(e.to_string())))??;

        let outcome = DeliveryOutcome {
            delivery_id,
            webhook_id: webhook.id,
            event: event.event,
            status,
            attempts,
            response_code,
            error: last_error,
            failure_count,
            disabled,
        };

        if delivered {
            debug!(webhook_id = %webhook.id, delivery_id = %delivery_id, attempts, "Webhook delivered");
        } else {
            warn!(
                org_id = %webhook.organization_id,
                webhook_id = %webhook.id,
                delivery_id = %delivery_id,
                attempts,
                failure_count,
                "Webhook delivery failed"
            );
        }

        if disabled {
            self.announce_disabled(snapshot, webhook, &outcome);
        }
        Ok(outcome)
    }

    fn announce_disabled(
        self: &Arc<Self>,
        snapshot: &ContextSnapshot,
        webhook: &Webhook,
        outcome: &DeliveryOutcome,
    ) {
        let reason = outcome.error.clone().unwrap_or_default();
        if let Some(notifier) = &self.notifier {
            notifier.webhook_disabled(webhook, outcome.failure_count, &reason);
        }
        if outcome.event == EventName::WebhookFailed {
            return;
        }
        let event = DomainEvent::new(
            EventName::WebhookFailed,
            webhook.organization_id,
            json!({
                "webhook_id": webhook.id,
                "url": webhook.url,
                "failure_count": outcome.failure_count,
                "last_failure_reason": reason,
            }),
        );
        self.publish(snapshot, event);
    }
}

/// Appends the delivery row and updates the webhook's counters on one unit
/// of work. Returns the new failure count and whether the hook was disabled.
fn record_delivery(
    gateway: &TenantGateway,
    snapshot: &ContextSnapshot,
    webhook: &Webhook,
    delivery: &WebhookDelivery,
    threshold: i32,
) -> Result<(i32, bool), GovernanceError> {
    let mut uow = gateway.enter_snapshot(snapshot)?;
    let now = delivery.completed_at;
    uow.write()?.insert_webhook_delivery(delivery)?;

    if delivery.error.is_none() {
        uow.write()?.record_webhook_success(webhook.id, now)?;
        uow.commit()?;
        return Ok((0, false));
    }

    let reason = delivery.error.as_deref().unwrap_or("unknown");
    let count = uow.write()?.record_webhook_failure(webhook.id, reason, now)?;
    let disable = count > threshold
        && uow
            .read()
            .webhook(webhook.id)?
            .map(|w| w.enabled)
            .unwrap_or(false);

    if disable {
        uow.write()?.disable_webhook(webhook.id, now)?;
        AuditRecorder::new().record(
            &mut uow,
            AuditEntry::updated(
                "webhook",
                &webhook.id.to_string(),
                json!({"enabled": true, "secret": REDACTED}),
                json!({"enabled": false, "failure_count": count, "last_failure_reason": reason, "secret": REDACTED}),
            )
            .with_action("webhook.disabled"),
        )?;
    }
    uow.commit()?;
    Ok((count, disable))
}
