//! Webhook notifier that alerts human support about escalated conversations.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{info, warn};

use crate::collaborators::{SupportNotice, SupportNotifier};
use crate::http_helpers::{build_http_client, send_with_retry};

const CONVERSATION_LINK_BASE: &str = "https://pancake.vn";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct NoticeCustomer {
    pid: String,
    page_pid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct NoticeAttribute {
    name: &'static str,
    value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct NoticeEnvelope {
    customer: NoticeCustomer,
    attrs: Vec<NoticeAttribute>,
}

/// Deep link that opens the conversation in the platform inbox.
pub fn conversation_link(resource_id: &str, conversation_id: &str) -> String {
    format!("{CONVERSATION_LINK_BASE}/{resource_id}?c_id={conversation_id}")
}

fn notice_envelope(notice: &SupportNotice) -> NoticeEnvelope {
    let attribute = |name: &'static str, value: &str| NoticeAttribute {
        name,
        value: value.to_string(),
    };
    NoticeEnvelope {
        customer: NoticeCustomer {
            pid: notice.conversation_id.clone(),
            page_pid: notice.resource_id.clone(),
        },
        attrs: vec![
            attribute("customer_name", &notice.customer_name),
            attribute("customer_phone", &notice.phone),
            attribute("page_name", &notice.resource_name),
            attribute("conversation_id", &notice.conversation_id),
            attribute("intent", &notice.intent),
            attribute(
                "pancake_link",
                &conversation_link(&notice.resource_id, &notice.conversation_id),
            ),
        ],
    }
}

#[derive(Clone)]
pub struct WebhookSupportNotifier {
    http: reqwest::Client,
    endpoint: String,
    bearer_token: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl WebhookSupportNotifier {
    pub fn new(
        endpoint: impl Into<String>,
        bearer_token: impl Into<String>,
        request_timeout_ms: u64,
    ) -> Result<Self> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            bail!("support notifier endpoint must not be empty");
        }
        Ok(Self {
            http: build_http_client("pagebridge-notify", request_timeout_ms)?,
            endpoint,
            bearer_token: bearer_token.into().trim().to_string(),
            retry_max_attempts: 2,
            retry_base_delay_ms: 500,
        })
    }

    pub fn with_retry(mut self, max_attempts: usize, base_delay_ms: u64) -> Self {
        self.retry_max_attempts = max_attempts.max(1);
        self.retry_base_delay_ms = base_delay_ms.max(1);
        self
    }
}

#[async_trait]
impl SupportNotifier for WebhookSupportNotifier {
    async fn notify(&self, notice: SupportNotice) -> Result<()> {
        let envelope = notice_envelope(&notice);
        send_with_retry(
            "support notification",
            self.retry_max_attempts,
            self.retry_base_delay_ms,
            || {
                let request = self.http.post(&self.endpoint).json(&envelope);
                if self.bearer_token.is_empty() {
                    request
                } else {
                    request.bearer_auth(&self.bearer_token)
                }
            },
        )
        .await?;
        info!(
            conversation_id = %notice.conversation_id,
            resource_id = %notice.resource_id,
            intent = %notice.intent,
            "support notified"
        );
        Ok(())
    }
}

/// Logs escalations when no support webhook is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSupportNotifier;

#[async_trait]
impl SupportNotifier for LoggingSupportNotifier {
    async fn notify(&self, notice: SupportNotice) -> Result<()> {
        warn!(
            conversation_id = %notice.conversation_id,
            resource_id = %notice.resource_id,
            customer_name = %notice.customer_name,
            intent = %notice.intent,
            link = %conversation_link(&notice.resource_id, &notice.conversation_id),
            "support escalation (no webhook configured)"
        );
        Ok(())
    }
}
