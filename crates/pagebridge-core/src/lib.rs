//! Shared data model for the pagebridge ingestion pipeline.
//!
//! Holds the managed-resource configuration snapshot, the decoded
//! conversation update event and small time helpers used by the socket,
//! event-bus and runtime crates.

pub mod conversation;
pub mod resource;
pub mod time_utils;
mod wire_ids;

pub use conversation::{ConversationPayloadError, ConversationUpdateEvent, INBOX_TYPE};
pub use resource::{
    ConfigSnapshot, ManagedResource, ResourceDescriptor, ResourceTag, ResourceTagDescriptor,
    SnapshotHandle,
};
pub use time_utils::current_unix_timestamp_ms;
