//! Messaging-platform public API client used for conversation tagging.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use pagebridge_core::SnapshotHandle;
use serde_json::Value;
use tracing::info;

use crate::collaborators::ConversationTagger;
use crate::http_helpers::{build_http_client, send_with_retry, truncate_for_error};

pub const DEFAULT_PLATFORM_API_BASE: &str = "https://pages.fm/api/public_api/v1";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;
const ADD_TAG_ACTION: &str = "add tag";

#[derive(Debug, Clone)]
pub struct PlatformApiConfig {
    pub api_base: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
}

impl Default for PlatformApiConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_PLATFORM_API_BASE.to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1_000,
        }
    }
}

/// Tags conversations through the platform API. Page access tokens are read
/// from the live snapshot so a reload takes effect on the next call.
#[derive(Clone)]
pub struct PlatformApiClient {
    http: reqwest::Client,
    api_base: String,
    snapshot: SnapshotHandle,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl PlatformApiClient {
    pub fn new(config: PlatformApiConfig, snapshot: SnapshotHandle) -> Result<Self> {
        let http = build_http_client("pagebridge", config.request_timeout_ms)?;
        Ok(Self {
            http,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            snapshot,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_delay_ms: config.retry_base_delay_ms.max(1),
        })
    }

    fn page_access_token(&self, resource_id: &str) -> Result<String> {
        let snapshot = self.snapshot.load();
        let resource = snapshot
            .get(resource_id)
            .ok_or_else(|| anyhow!("page {resource_id} is not managed"))?;
        if !resource.has_access_token() {
            bail!("page {resource_id} has no access token");
        }
        Ok(resource.access_token.clone())
    }

    async fn manage_tag(
        &self,
        action: &str,
        resource_id: &str,
        conversation_id: &str,
        tag_id: &str,
    ) -> Result<()> {
        let token = self.page_access_token(resource_id)?;
        let url = format!(
            "{}/pages/{resource_id}/conversations/{conversation_id}/tags",
            self.api_base
        );
        let query = [
            ("page_id", resource_id),
            ("page_access_token", token.as_str()),
            ("conversation_id", conversation_id),
        ];
        let form = [("action", action), ("tag_id", tag_id)];

        let body = send_with_retry(
            "platform tag update",
            self.retry_max_attempts,
            self.retry_base_delay_ms,
            || self.http.post(&url).query(&query).form(&form),
        )
        .await?;

        let rejected = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|value| value.get("success").and_then(Value::as_bool))
            == Some(false);
        if rejected {
            bail!(
                "platform rejected tag update: {}",
                truncate_for_error(&body, 400)
            );
        }
        info!(
            resource_id,
            conversation_id,
            tag_id,
            action,
            "conversation tag updated"
        );
        Ok(())
    }
}

#[async_trait]
impl ConversationTagger for PlatformApiClient {
    async fn add_tag(&self, resource_id: &str, conversation_id: &str, tag_id: &str) -> Result<()> {
        self.manage_tag(ADD_TAG_ACTION, resource_id, conversation_id, tag_id)
            .await
    }
}
