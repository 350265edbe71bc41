use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use pagebridge_core::current_unix_timestamp_ms;

use crate::collaborators::{ConversationRecord, ConversationStore, EnsuredConversation};

/// Process-local conversation store. Records live for the process lifetime.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    records: Mutex<HashMap<String, ConversationRecord>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock_records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_records(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversationRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create_or_get(
        &self,
        conversation_id: &str,
        resource_id: &str,
        customer_id: &str,
        customer_name: &str,
    ) -> Result<EnsuredConversation> {
        let mut records = self.lock_records();
        if let Some(existing) = records.get(conversation_id) {
            return Ok(EnsuredConversation {
                is_new: false,
                record: Some(existing.clone()),
            });
        }
        let record = ConversationRecord {
            conversation_id: conversation_id.to_string(),
            resource_id: resource_id.to_string(),
            customer_id: customer_id.to_string(),
            customer_name: customer_name.to_string(),
            created_unix_ms: current_unix_timestamp_ms(),
        };
        records.insert(conversation_id.to_string(), record.clone());
        Ok(EnsuredConversation {
            is_new: true,
            record: Some(record),
        })
    }
}
