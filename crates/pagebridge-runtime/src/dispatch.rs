//! Downstream dispatch handlers for debounced conversations.

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::info;

use crate::collaborators::{DispatchHandler, PendingConversation};
use crate::http_helpers::{build_http_client, send_with_retry};

/// Forwards each pending conversation as JSON to an answer-generation
/// endpoint.
#[derive(Clone)]
pub struct WebhookDispatchHandler {
    http: reqwest::Client,
    endpoint: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl WebhookDispatchHandler {
    pub fn new(endpoint: impl Into<String>, request_timeout_ms: u64) -> Result<Self> {
        let endpoint = endpoint.into().trim().to_string();
        if endpoint.is_empty() {
            bail!("dispatch endpoint must not be empty");
        }
        Ok(Self {
            http: build_http_client("pagebridge-dispatch", request_timeout_ms)?,
            endpoint,
            retry_max_attempts: 2,
            retry_base_delay_ms: 500,
        })
    }
}

#[async_trait]
impl DispatchHandler for WebhookDispatchHandler {
    async fn dispatch(&self, pending: PendingConversation) -> Result<()> {
        send_with_retry(
            "conversation dispatch",
            self.retry_max_attempts,
            self.retry_base_delay_ms,
            || self.http.post(&self.endpoint).json(&pending),
        )
        .await?;
        info!(
            conversation_id = %pending.conversation_id,
            resource_id = %pending.resource_id,
            "conversation dispatched"
        );
        Ok(())
    }
}

/// Logs pending conversations without forwarding them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingDispatchHandler;

#[async_trait]
impl DispatchHandler for LoggingDispatchHandler {
    async fn dispatch(&self, pending: PendingConversation) -> Result<()> {
        info!(
            conversation_id = %pending.conversation_id,
            resource_id = %pending.resource_id,
            customer_name = %pending.customer_name,
            last_message = %pending.last_message,
            "conversation ready for dispatch"
        );
        Ok(())
    }
}
