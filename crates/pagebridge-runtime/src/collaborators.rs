//! Collaborator contracts consumed by the update router and the reload
//! controller. Default implementations live in sibling modules.

use anyhow::Result;
use async_trait::async_trait;
use pagebridge_core::ResourceDescriptor;
use serde::{Deserialize, Serialize};

/// Stored conversation record returned by [`ConversationStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub conversation_id: String,
    pub resource_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub created_unix_ms: u64,
}

/// Result of [`ConversationStore::create_or_get`]. `record` is `None` when
/// the store could neither find nor create the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredConversation {
    pub is_new: bool,
    pub record: Option<ConversationRecord>,
}

/// Escalation notice sent to human support.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SupportNotice {
    pub customer_name: String,
    pub phone: String,
    pub resource_name: String,
    pub conversation_id: String,
    pub resource_id: String,
    pub intent: String,
}

/// Payload captured when a conversation is scheduled for dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingConversation {
    pub conversation_id: String,
    pub resource_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub content: String,
    pub last_message: String,
}

#[async_trait]
/// Trait contract for `ConversationStore` behavior.
pub trait ConversationStore: Send + Sync {
    async fn create_or_get(
        &self,
        conversation_id: &str,
        resource_id: &str,
        customer_id: &str,
        customer_name: &str,
    ) -> Result<EnsuredConversation>;
}

#[async_trait]
/// Trait contract for `ResourceCatalog` behavior.
pub trait ResourceCatalog: Send + Sync {
    async fn list_active_resources(&self) -> Result<Vec<ResourceDescriptor>>;
}

#[async_trait]
/// Trait contract for `ConversationTagger` behavior.
pub trait ConversationTagger: Send + Sync {
    async fn add_tag(&self, resource_id: &str, conversation_id: &str, tag_id: &str) -> Result<()>;
}

#[async_trait]
/// Trait contract for `SupportNotifier` behavior.
pub trait SupportNotifier: Send + Sync {
    async fn notify(&self, notice: SupportNotice) -> Result<()>;
}

#[async_trait]
/// Downstream consumer of debounced conversations.
pub trait DispatchHandler: Send + Sync {
    async fn dispatch(&self, pending: PendingConversation) -> Result<()>;
}
