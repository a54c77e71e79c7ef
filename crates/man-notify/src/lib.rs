//! Notification Dispatcher (spec.md §4/§6): fire-and-forget fan-out fired
//! when a RED task is created. Grounded on the multi-channel dispatch in
//! `original_source/orchestrator/services/notifications.py`, generalizing
//! `tandem-channels::dispatcher`'s webhook relay pattern (`add_auth` +
//! `reqwest::Client`) to the channel set this system needs.
//!
//! Channels are read from `MAN_NOTIFICATION_CHANNELS` (comma-separated:
//! `webhook,slack,email,console`); delivery never blocks task creation —
//! every backend's failure is logged and swallowed.

use std::env;

use async_trait::async_trait;
use man_observability::redact;
use man_types::ManTask;
use serde_json::json;

#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub channels: Vec<NotificationChannel>,
    pub webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub email_endpoint: Option<String>,
    pub dashboard_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationChannel {
    Webhook,
    Slack,
    Email,
    Console,
}

impl NotificationConfig {
    /// `MAN_NOTIFICATION_CHANNELS`, `MAN_NOTIFICATION_WEBHOOK_URL`,
    /// `MAN_SLACK_WEBHOOK_URL`, `MAN_EMAIL_NOTIFICATION_ENDPOINT`,
    /// `MAN_DASHBOARD_URL` (spec.md §6).
    pub fn from_env() -> Self {
        let channels = env::var("MAN_NOTIFICATION_CHANNELS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|s| match s.trim().to_lowercase().as_str() {
                        "webhook" => Some(NotificationChannel::Webhook),
                        "slack" => Some(NotificationChannel::Slack),
                        "email" => Some(NotificationChannel::Email),
                        "console" => Some(NotificationChannel::Console),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            channels,
            webhook_url: env::var("MAN_NOTIFICATION_WEBHOOK_URL").ok(),
            slack_webhook_url: env::var("MAN_SLACK_WEBHOOK_URL").ok(),
            email_endpoint: env::var("MAN_EMAIL_NOTIFICATION_ENDPOINT").ok(),
            dashboard_url: env::var("MAN_DASHBOARD_URL").ok(),
        }
    }
}

/// One outbound channel backend. `send` must never propagate an error past
/// the dispatcher; backends log their own failures.
#[async_trait]
trait Backend: Send + Sync {
    async fn send(&self, task: &ManTask, client: &reqwest::Client, config: &NotificationConfig);
}

struct WebhookBackend;
struct SlackBackend;
struct EmailBackend;
struct ConsoleBackend;

fn task_payload(task: &ManTask, dashboard_url: Option<&str>) -> serde_json::Value {
    let redacted_intent = redact(&serde_json::to_value(&task.intent).unwrap_or(serde_json::Value::Null));
    json!({
        "task_id": task.id,
        "tenant_id": task.tenant_id,
        "workflow_id": task.workflow_id,
        "step_id": task.step_id,
        "tool_name": task.tool_name,
        "risk_score": task.risk_score,
        "risk_reasons": task.risk_reasons,
        "intent": redacted_intent,
        "dashboard_url": dashboard_url,
    })
}

#[async_trait]
impl Backend for WebhookBackend {
    async fn send(&self, task: &ManTask, client: &reqwest::Client, config: &NotificationConfig) {
        let Some(url) = &config.webhook_url else {
            tracing::warn!("webhook channel enabled but MAN_NOTIFICATION_WEBHOOK_URL is unset");
            return;
        };
        let payload = task_payload(task, config.dashboard_url.as_deref());
        if let Err(e) = client.post(url).json(&payload).send().await {
            tracing::warn!(task_id = %task.id, error = %e, "webhook notification delivery failed");
        }
    }
}

#[async_trait]
impl Backend for SlackBackend {
    async fn send(&self, task: &ManTask, client: &reqwest::Client, config: &NotificationConfig) {
        let Some(url) = &config.slack_webhook_url else {
            tracing::warn!("slack channel enabled but MAN_SLACK_WEBHOOK_URL is unset");
            return;
        };
        let text = format!(
            "MAN approval required: `{}` on workflow `{}` (risk {:.2})",
            task.tool_name, task.workflow_id, task.risk_score
        );
        if let Err(e) = client.post(url).json(&json!({ "text": text })).send().await {
            tracing::warn!(task_id = %task.id, error = %e, "slack notification delivery failed");
        }
    }
}

#[async_trait]
impl Backend for EmailBackend {
    async fn send(&self, task: &ManTask, client: &reqwest::Client, config: &NotificationConfig) {
        let Some(url) = &config.email_endpoint else {
            tracing::warn!("email channel enabled but MAN_EMAIL_NOTIFICATION_ENDPOINT is unset");
            return;
        };
        // No SMTP stack exists in this corpus; email is a webhook-shaped
        // POST to whatever relay fronts the mail provider.
        let payload = task_payload(task, config.dashboard_url.as_deref());
        if let Err(e) = client.post(url).json(&payload).send().await {
            tracing::warn!(task_id = %task.id, error = %e, "email notification delivery failed");
        }
    }
}

#[async_trait]
impl Backend for ConsoleBackend {
    async fn send(&self, task: &ManTask, _client: &reqwest::Client, _config: &NotificationConfig) {
        tracing::warn!(
            task_id = %task.id,
            tool = %task.tool_name,
            workflow_id = %task.workflow_id,
            risk_score = task.risk_score,
            "MAN approval required"
        );
    }
}

/// Fans `task` out over every configured channel concurrently. Never fails:
/// each backend swallows and logs its own delivery error.
pub struct NotificationDispatcher {
    config: NotificationConfig,
    client: reqwest::Client,
}

impl NotificationDispatcher {
    pub fn new(config: NotificationConfig) -> Self {
        Self { config, client: reqwest::Client::new() }
    }

    pub async fn dispatch(&self, task: &ManTask) {
        let backends: Vec<Box<dyn Backend>> = self
            .config
            .channels
            .iter()
            .map(|channel| -> Box<dyn Backend> {
                match channel {
                    NotificationChannel::Webhook => Box::new(WebhookBackend),
                    NotificationChannel::Slack => Box::new(SlackBackend),
                    NotificationChannel::Email => Box::new(EmailBackend),
                    NotificationChannel::Console => Box::new(ConsoleBackend),
                }
            })
            .collect();

        let sends = backends.iter().map(|b| b.send(task, &self.client, &self.config));
        futures::future::join_all(sends).await;
    }
}
