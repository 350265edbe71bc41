//! Conversation update events decoded from `pages:update_conversation`
//! frame payloads.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::wire_ids::{id_list, string_or_number};

/// Inbox-type discriminator for direct customer messages.
pub const INBOX_TYPE: &str = "INBOX";

const UNKNOWN_NAME: &str = "No name";

#[derive(Debug, Error)]
pub enum ConversationPayloadError {
    #[error("conversation payload could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("conversation payload is missing the conversation id")]
    MissingConversationId,
    #[error("conversation payload is missing the page id")]
    MissingResourceId,
}

/// One inbound conversation update, as seen by the update router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationUpdateEvent {
    pub conversation_id: String,
    pub resource_id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub sender_name: String,
    pub inbox_type: String,
    pub snippet: String,
    pub tag_ids: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
struct UpdateConversationPayload {
    conversation: RawConversation,
}

#[derive(Debug, Deserialize)]
struct RawConversation {
    #[serde(default, deserialize_with = "string_or_number")]
    id: String,
    #[serde(default, deserialize_with = "string_or_number")]
    page_id: String,
    #[serde(default)]
    customers: Vec<RawCustomer>,
    #[serde(default)]
    last_sent_by: Option<RawSender>,
    #[serde(rename = "type", default)]
    inbox_type: Option<String>,
    #[serde(default)]
    updated_at: Option<Value>,
    #[serde(default)]
    snippet: Option<String>,
    #[serde(default, deserialize_with = "id_list")]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawCustomer {
    #[serde(default, deserialize_with = "string_or_number")]
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSender {
    #[serde(default)]
    name: Option<String>,
}

impl ConversationUpdateEvent {
    /// Decodes the payload of an update-conversation frame.
    pub fn from_payload(payload: &Value) -> Result<Self, ConversationPayloadError> {
        let decoded = UpdateConversationPayload::deserialize(payload)?;
        let conversation = decoded.conversation;

        let conversation_id = conversation.id.trim().to_string();
        if conversation_id.is_empty() {
            return Err(ConversationPayloadError::MissingConversationId);
        }
        let resource_id = conversation.page_id.trim().to_string();
        if resource_id.is_empty() {
            return Err(ConversationPayloadError::MissingResourceId);
        }

        let (customer_id, customer_name) = conversation
            .customers
            .into_iter()
            .next()
            .map(|customer| (customer.id, non_blank_or_unknown(customer.name)))
            .unwrap_or_else(|| (String::new(), UNKNOWN_NAME.to_string()));

        let updated_at = match conversation.updated_at {
            Some(Value::String(value)) => value,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };

        Ok(Self {
            conversation_id,
            resource_id,
            customer_id,
            customer_name,
            sender_name: non_blank_or_unknown(
                conversation.last_sent_by.and_then(|sender| sender.name),
            ),
            inbox_type: conversation
                .inbox_type
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| INBOX_TYPE.to_string()),
            snippet: conversation.snippet.unwrap_or_default(),
            tag_ids: conversation.tags,
            updated_at,
        })
    }

    pub fn is_inbox(&self) -> bool {
        self.inbox_type == INBOX_TYPE
    }

    pub fn has_tag(&self, tag_id: &str) -> bool {
        self.tag_ids.iter().any(|candidate| candidate == tag_id)
    }

    /// Last-message line handed to downstream dispatch.
    pub fn formatted_last_message(&self) -> String {
        format!("{} - {}", self.snippet, self.updated_at)
    }
}

fn non_blank_or_unknown(value: Option<String>) -> String {
    value
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| UNKNOWN_NAME.to_string())
}
