//! Conversation update routing: dedup, filtering, tagging, escalation and
//! debounced hand-off to the downstream dispatcher.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pagebridge_core::{ConfigSnapshot, ConversationUpdateEvent, SnapshotHandle};
use pagebridge_socket::{FrameHandler, InboundFrame};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{
    ConversationStore, ConversationTagger, DispatchHandler, PendingConversation, SupportNotice,
    SupportNotifier,
};
use crate::debounce::{DebounceScheduler, DEFAULT_DEBOUNCE_DELAY};
use crate::dedup::{DedupCache, DEFAULT_DEDUP_WINDOW};

pub const DEFAULT_AI_TAG_NAME: &str = "AI handling";
pub const DEFAULT_SUPPORT_TAG_NAME: &str = "human support";
pub const ESCALATION_INTENT: &str = "customer sent photo or video";
const MEDIA_MARKERS: [&str; 2] = ["[Photo]", "[Video]"];

/// Tag names looked up (case-insensitively) in each resource's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagNames {
    pub ai_handling: String,
    pub human_support: String,
}

impl Default for TagNames {
    fn default() -> Self {
        Self {
            ai_handling: DEFAULT_AI_TAG_NAME.to_string(),
            human_support: DEFAULT_SUPPORT_TAG_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotInbox,
    SelfEcho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    MissingResource,
    MissingAccessToken,
    Persistence,
}

/// Terminal state of one routed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Suppressed,
    Dropped(DropReason),
    Skipped(SkipReason),
    HandedOff,
    Escalated,
    Scheduled,
    /// A newer update for the conversation was scheduled first.
    Superseded,
}

impl RouteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Suppressed => "suppressed",
            Self::Dropped(DropReason::NotInbox) => "dropped_not_inbox",
            Self::Dropped(DropReason::SelfEcho) => "dropped_self_echo",
            Self::Skipped(SkipReason::MissingResource) => "skipped_missing_resource",
            Self::Skipped(SkipReason::MissingAccessToken) => "skipped_missing_access_token",
            Self::Skipped(SkipReason::Persistence) => "skipped_persistence",
            Self::HandedOff => "handed_off",
            Self::Escalated => "escalated",
            Self::Scheduled => "scheduled",
            Self::Superseded => "superseded",
        }
    }
}

pub struct UpdateRouterConfig {
    pub snapshot: SnapshotHandle,
    pub store: Arc<dyn ConversationStore>,
    pub tagger: Arc<dyn ConversationTagger>,
    pub notifier: Arc<dyn SupportNotifier>,
    pub dispatcher: Arc<dyn DispatchHandler>,
    pub tag_names: TagNames,
    pub debounce_delay: Duration,
    pub dedup_window: Duration,
}

impl UpdateRouterConfig {
    pub fn new(
        snapshot: SnapshotHandle,
        store: Arc<dyn ConversationStore>,
        tagger: Arc<dyn ConversationTagger>,
        notifier: Arc<dyn SupportNotifier>,
        dispatcher: Arc<dyn DispatchHandler>,
    ) -> Self {
        Self {
            snapshot,
            store,
            tagger,
            notifier,
            dispatcher,
            tag_names: TagNames::default(),
            debounce_delay: DEFAULT_DEBOUNCE_DELAY,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

struct ResolvedTags {
    resource_name: String,
    ai_handling: Option<String>,
    human_support: Option<String>,
}

pub struct UpdateRouter {
    snapshot: SnapshotHandle,
    store: Arc<dyn ConversationStore>,
    tagger: Arc<dyn ConversationTagger>,
    notifier: Arc<dyn SupportNotifier>,
    dispatcher: Arc<dyn DispatchHandler>,
    tag_names: TagNames,
    dedup: DedupCache,
    scheduler: DebounceScheduler<PendingConversation>,
}

impl UpdateRouter {
    pub fn new(config: UpdateRouterConfig) -> Self {
        Self {
            snapshot: config.snapshot,
            store: config.store,
            tagger: config.tagger,
            notifier: config.notifier,
            dispatcher: config.dispatcher,
            tag_names: config.tag_names,
            dedup: DedupCache::new(config.dedup_window),
            scheduler: DebounceScheduler::new(config.debounce_delay),
        }
    }

    pub fn scheduler(&self) -> &DebounceScheduler<PendingConversation> {
        &self.scheduler
    }

    pub fn snapshot(&self) -> &SnapshotHandle {
        &self.snapshot
    }

    pub async fn route(&self, event: &ConversationUpdateEvent) -> RouteOutcome {
        let outcome = self.route_inner(event).await;
        info!(
            conversation_id = %event.conversation_id,
            resource_id = %event.resource_id,
            outcome = outcome.as_str(),
            "conversation update routed"
        );
        outcome
    }

    async fn route_inner(&self, event: &ConversationUpdateEvent) -> RouteOutcome {
        let conversation_id = event.conversation_id.as_str();
        let resource_id = event.resource_id.as_str();

        if self
            .dedup
            .check_and_record(conversation_id, &event.snippet, Instant::now())
        {
            return RouteOutcome::Suppressed;
        }
        if !event.is_inbox() {
            debug!(conversation_id, inbox_type = %event.inbox_type, "ignoring non-inbox update");
            return RouteOutcome::Dropped(DropReason::NotInbox);
        }

        // One snapshot load per update so every step sees the same resources.
        let snapshot = self.snapshot.load_full();
        if snapshot.is_resource_sender(&event.sender_name) {
            debug!(conversation_id, sender = %event.sender_name, "ignoring own outbound echo");
            return RouteOutcome::Dropped(DropReason::SelfEcho);
        }

        let tags = match self.resolve_tags(&snapshot, resource_id) {
            Ok(tags) => tags,
            Err(reason) => {
                warn!(
                    conversation_id,
                    resource_id,
                    reason = RouteOutcome::Skipped(reason).as_str(),
                    "resource configuration missing for update"
                );
                return RouteOutcome::Skipped(reason);
            }
        };

        // Taken before the first await so concurrent updates for the same
        // conversation keep their arrival order in the scheduler.
        let ticket = self.scheduler.reserve(conversation_id);

        if let Some(tag_id) = tags.ai_handling.as_deref() {
            self.add_tag_logged(resource_id, conversation_id, tag_id)
                .await;
        }

        if let Some(support_tag) = tags.human_support.as_deref() {
            if event.has_tag(support_tag) {
                info!(conversation_id, "conversation is handled by human support");
                return RouteOutcome::HandedOff;
            }
        }

        if MEDIA_MARKERS
            .iter()
            .any(|marker| event.snippet.contains(marker))
        {
            self.escalate(event, &tags).await;
            return RouteOutcome::Escalated;
        }

        match self
            .store
            .create_or_get(
                conversation_id,
                resource_id,
                &event.customer_id,
                &event.customer_name,
            )
            .await
        {
            Ok(ensured) if ensured.record.is_some() => {
                debug!(conversation_id, is_new = ensured.is_new, "conversation ensured");
            }
            Ok(_) => {
                warn!(conversation_id, "conversation store returned no record");
                return RouteOutcome::Skipped(SkipReason::Persistence);
            }
            Err(store_error) => {
                warn!(
                    conversation_id,
                    error = %format!("{store_error:#}"),
                    "conversation store failed"
                );
                return RouteOutcome::Skipped(SkipReason::Persistence);
            }
        }

        let pending = PendingConversation {
            conversation_id: event.conversation_id.clone(),
            resource_id: event.resource_id.clone(),
            customer_id: event.customer_id.clone(),
            customer_name: event.customer_name.clone(),
            content: event.snippet.clone(),
            last_message: event.formatted_last_message(),
        };
        let dispatcher = Arc::clone(&self.dispatcher);
        let scheduled = self
            .scheduler
            .schedule_ticket(ticket, pending, move |pending| async move {
                dispatcher.dispatch(pending).await
            });
        if scheduled {
            RouteOutcome::Scheduled
        } else {
            debug!(conversation_id, "newer update already scheduled");
            RouteOutcome::Superseded
        }
    }

    fn resolve_tags(
        &self,
        snapshot: &ConfigSnapshot,
        resource_id: &str,
    ) -> Result<ResolvedTags, SkipReason> {
        let resource = snapshot
            .get(resource_id)
            .ok_or(SkipReason::MissingResource)?;
        if !resource.has_access_token() {
            return Err(SkipReason::MissingAccessToken);
        }
        Ok(ResolvedTags {
            resource_name: resource.display_name.clone(),
            ai_handling: resource
                .find_tag_id(&self.tag_names.ai_handling)
                .map(str::to_string),
            human_support: resource
                .find_tag_id(&self.tag_names.human_support)
                .map(str::to_string),
        })
    }

    async fn escalate(&self, event: &ConversationUpdateEvent, tags: &ResolvedTags) {
        info!(
            conversation_id = %event.conversation_id,
            "customer sent media, escalating to human support"
        );
        if let Some(tag_id) = tags.human_support.as_deref() {
            self.add_tag_logged(&event.resource_id, &event.conversation_id, tag_id)
                .await;
        }
        let notice = SupportNotice {
            customer_name: event.customer_name.clone(),
            phone: String::new(),
            resource_name: tags.resource_name.clone(),
            conversation_id: event.conversation_id.clone(),
            resource_id: event.resource_id.clone(),
            intent: ESCALATION_INTENT.to_string(),
        };
        if let Err(notify_error) = self.notifier.notify(notice).await {
            warn!(
                conversation_id = %event.conversation_id,
                error = %format!("{notify_error:#}"),
                "support notification failed"
            );
        }
    }

    async fn add_tag_logged(&self, resource_id: &str, conversation_id: &str, tag_id: &str) {
        if let Err(tag_error) = self
            .tagger
            .add_tag(resource_id, conversation_id, tag_id)
            .await
        {
            warn!(
                conversation_id,
                resource_id,
                tag_id,
                error = %format!("{tag_error:#}"),
                "conversation tagging failed"
            );
        }
    }
}

#[async_trait]
impl FrameHandler for UpdateRouter {
    async fn handle_frame(&self, frame: &InboundFrame) -> Result<()> {
        let event = ConversationUpdateEvent::from_payload(&frame.payload)
            .with_context(|| format!("invalid update payload on {}", frame.channel))?;
        self.route(&event).await;
        Ok(())
    }
}
