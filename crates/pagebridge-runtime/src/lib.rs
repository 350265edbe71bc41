//! Event ingestion runtime: update routing, debounced dispatch and hot
//! reconfiguration of the platform socket session, plus the default
//! collaborator implementations used by the `pagebridge` binary.

pub mod collaborators;
pub mod debounce;
pub mod dedup;
pub mod dispatch;
pub mod file_catalog;
mod http_helpers;
pub mod memory_store;
pub mod platform_api_client;
pub mod reload_controller;
pub mod support_notifier;
pub mod update_router;

pub use collaborators::{
    ConversationRecord, ConversationStore, ConversationTagger, DispatchHandler,
    EnsuredConversation, PendingConversation, ResourceCatalog, SupportNotice, SupportNotifier,
};
pub use debounce::{DebounceScheduler, DispatchTicket, DEFAULT_DEBOUNCE_DELAY};
pub use dedup::{DedupCache, DEFAULT_DEDUP_WINDOW};
pub use dispatch::{LoggingDispatchHandler, WebhookDispatchHandler};
pub use file_catalog::FileResourceCatalog;
pub use memory_store::InMemoryConversationStore;
pub use platform_api_client::{PlatformApiClient, PlatformApiConfig, DEFAULT_PLATFORM_API_BASE};
pub use reload_controller::ReloadController;
pub use support_notifier::{LoggingSupportNotifier, WebhookSupportNotifier};
pub use update_router::{
    DropReason, RouteOutcome, SkipReason, TagNames, UpdateRouter, UpdateRouterConfig,
};
