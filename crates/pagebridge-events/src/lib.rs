//! In-process event bus for managed-resource configuration changes.
//!
//! Publishers emit [`ResourceEvent`]s when pages are created, updated,
//! deleted, activated, deactivated or bulk reloaded. Listeners subscribe to
//! one [`ResourceEventKind`] or to every kind. `emit` runs all matching
//! listeners concurrently and returns once each has finished; a failing or
//! panicking listener is logged and never affects the others.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use pagebridge_core::current_unix_timestamp_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ResourceEventKind` values.
pub enum ResourceEventKind {
    Created,
    Updated,
    Deleted,
    Activated,
    Deactivated,
    Reloaded,
}

impl ResourceEventKind {
    pub const ALL: [ResourceEventKind; 6] = [
        Self::Created,
        Self::Updated,
        Self::Deleted,
        Self::Activated,
        Self::Deactivated,
        Self::Reloaded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "resource_created",
            Self::Updated => "resource_updated",
            Self::Deleted => "resource_deleted",
            Self::Activated => "resource_activated",
            Self::Deactivated => "resource_deactivated",
            Self::Reloaded => "resources_reloaded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One configuration-change notification.
pub struct ResourceEvent {
    pub kind: ResourceEventKind,
    pub resource_id: String,
    #[serde(default)]
    pub detail: Option<Value>,
    pub occurred_unix_ms: u64,
}

impl ResourceEvent {
    pub fn new(kind: ResourceEventKind, resource_id: impl Into<String>) -> Self {
        Self {
            kind,
            resource_id: resource_id.into(),
            detail: None,
            occurred_unix_ms: current_unix_timestamp_ms(),
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

#[async_trait]
/// Trait contract for `ResourceEventListener` behavior.
pub trait ResourceEventListener: Send + Sync {
    async fn on_event(&self, event: &ResourceEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitReport {
    pub listeners: usize,
    pub failed: usize,
}

struct Subscription {
    id: SubscriptionId,
    kind: Option<ResourceEventKind>,
    listener: Arc<dyn ResourceEventListener>,
}

#[derive(Default)]
pub struct ResourceEventBus {
    next_id: AtomicU64,
    subscriptions: RwLock<Vec<Subscription>>,
}

impl ResourceEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: ResourceEventKind,
        listener: Arc<dyn ResourceEventListener>,
    ) -> SubscriptionId {
        let id = self.push(Some(kind), listener);
        info!(event = kind.as_str(), "subscribed resource event listener");
        id
    }

    pub fn subscribe_all(&self, listener: Arc<dyn ResourceEventListener>) -> SubscriptionId {
        let id = self.push(None, listener);
        info!("subscribed catch-all resource event listener");
        id
    }

    /// Removes a subscription; returns false when the id is unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.read_subscriptions().len()
    }

    /// Delivers `event` to every kind-specific listener for its kind and
    /// every catch-all listener, waiting for all of them.
    pub async fn emit(&self, event: ResourceEvent) -> EmitReport {
        let listeners = self.matching_listeners(event.kind);
        info!(
            event = event.kind.as_str(),
            resource_id = %event.resource_id,
            listeners = listeners.len(),
            "emitting resource event"
        );

        let deliveries = listeners.iter().map(|listener| {
            AssertUnwindSafe(listener.on_event(&event)).catch_unwind()
        });
        let outcomes = join_all(deliveries).await;

        let mut report = EmitReport {
            listeners: outcomes.len(),
            failed: 0,
        };
        for outcome in outcomes {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(listener_error)) => {
                    report.failed = report.failed.saturating_add(1);
                    warn!(
                        event = event.kind.as_str(),
                        error = %format!("{listener_error:#}"),
                        "resource event listener failed"
                    );
                }
                Err(_) => {
                    report.failed = report.failed.saturating_add(1);
                    error!(
                        event = event.kind.as_str(),
                        "resource event listener panicked"
                    );
                }
            }
        }
        report
    }

    fn push(
        &self,
        kind: Option<ResourceEventKind>,
        listener: Arc<dyn ResourceEventListener>,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut subscriptions = match self.subscriptions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subscriptions.push(Subscription { id, kind, listener });
        id
    }

    fn matching_listeners(&self, kind: ResourceEventKind) -> Vec<Arc<dyn ResourceEventListener>> {
        let subscriptions = self.read_subscriptions();
        let specific = subscriptions
            .iter()
            .filter(|subscription| subscription.kind == Some(kind));
        let catch_all = subscriptions
            .iter()
            .filter(|subscription| subscription.kind.is_none());
        specific
            .chain(catch_all)
            .map(|subscription| Arc::clone(&subscription.listener))
            .collect()
    }

    fn read_subscriptions(&self) -> std::sync::RwLockReadGuard<'_, Vec<Subscription>> {
        match self.subscriptions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
