//! Hot reconfiguration of the socket session.
//!
//! Every resource event tears down the active [`SocketClient`] and builds a
//! new one from a fresh catalog snapshot. All of it happens under one async
//! mutex, so reloads never interleave and at most one connect task runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use pagebridge_core::ConfigSnapshot;
use pagebridge_events::{ResourceEvent, ResourceEventListener};
use pagebridge_socket::{PlatformEvent, SocketClient, SocketConfig};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::collaborators::ResourceCatalog;
use crate::update_router::UpdateRouter;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ReloadState {
    client: Option<Arc<SocketClient>>,
    connect_task: Option<JoinHandle<()>>,
}

pub struct ReloadController {
    socket_template: SocketConfig,
    catalog: Arc<dyn ResourceCatalog>,
    router: Arc<UpdateRouter>,
    state: Mutex<ReloadState>,
    reload_count: AtomicU64,
    stop_grace: Duration,
}

impl ReloadController {
    /// `socket_template` supplies everything but the resource ids, which
    /// come from the catalog on each reload.
    pub fn new(
        socket_template: SocketConfig,
        catalog: Arc<dyn ResourceCatalog>,
        router: Arc<UpdateRouter>,
    ) -> Self {
        Self {
            socket_template,
            catalog,
            router,
            state: Mutex::new(ReloadState::default()),
            reload_count: AtomicU64::new(0),
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    /// Performs the initial load and connect.
    pub async fn start(&self) -> Result<()> {
        self.reload("startup").await
    }

    /// Completed reloads, including the initial one.
    pub fn reload_count(&self) -> u64 {
        self.reload_count.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        state
            .client
            .as_ref()
            .is_some_and(|client| client.is_connected())
    }

    /// Channels joined by the active client, empty when none is running.
    pub async fn active_channels(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state
            .client
            .as_ref()
            .map(|client| client.channels())
            .unwrap_or_default()
    }

    /// Tears down the client and connect task and cancels every pending
    /// debounced dispatch. Dispatches already running are left to finish.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        self.teardown(&mut state).await;
        let cancelled = self.router.scheduler().cancel_all();
        info!(cancelled, "reload controller shut down");
    }

    pub async fn reload(&self, reason: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        info!(reason, "reloading socket configuration");

        let first_error = match self.rebuild(&mut state).await {
            Ok(resources) => {
                self.record_reload(reason, resources);
                return Ok(());
            }
            Err(error) => error,
        };
        warn!(
            reason,
            error = %format!("{first_error:#}"),
            "reload failed, attempting recovery"
        );

        match self.rebuild(&mut state).await {
            Ok(resources) => {
                self.record_reload(reason, resources);
                Ok(())
            }
            Err(recovery_error) => {
                error!(
                    reason,
                    error = %format!("{recovery_error:#}"),
                    "reload recovery failed, socket left disconnected"
                );
                Err(recovery_error.context("reload recovery failed"))
            }
        }
    }

    fn record_reload(&self, reason: &str, resources: usize) {
        let count = self.reload_count.fetch_add(1, Ordering::SeqCst) + 1;
        info!(reason, resources, reload_count = count, "socket configuration reloaded");
    }

    async fn rebuild(&self, state: &mut ReloadState) -> Result<usize> {
        self.teardown(state).await;

        let descriptors = self
            .catalog
            .list_active_resources()
            .await
            .context("failed to load managed resources")?;
        let snapshot = Arc::new(ConfigSnapshot::from_descriptors(descriptors));
        let resource_ids = snapshot.resource_ids();
        let resources = snapshot.len();
        self.router.snapshot().store(snapshot);

        let mut config = self.socket_template.clone();
        config.resource_ids = resource_ids;
        let client = Arc::new(SocketClient::new(config));
        client.subscribe(PlatformEvent::UpdateConversation, self.router.clone());

        let runner = Arc::clone(&client);
        state.connect_task = Some(tokio::spawn(async move { runner.start().await }));
        state.client = Some(client);
        Ok(resources)
    }

    /// Stops the client, then waits for its connect task to drain. A task
    /// that outlives the grace period is aborted.
    async fn teardown(&self, state: &mut ReloadState) {
        if let Some(client) = state.client.take() {
            client.stop().await;
        }
        let Some(mut task) = state.connect_task.take() else {
            return;
        };
        if task.is_finished() {
            log_connect_task_exit(task.await);
            return;
        }
        match tokio::time::timeout(self.stop_grace, &mut task).await {
            Ok(result) => log_connect_task_exit(result),
            Err(_) => {
                warn!(
                    grace_ms = self.stop_grace.as_millis() as u64,
                    "connect task did not stop in time, aborting"
                );
                task.abort();
                log_connect_task_exit(task.await);
            }
        }
    }
}

fn log_connect_task_exit(result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => debug!("connect task finished"),
        Err(join_error) if join_error.is_cancelled() => debug!("connect task cancelled"),
        Err(join_error) => error!(error = %join_error, "connect task panicked"),
    }
}

#[async_trait]
impl ResourceEventListener for ReloadController {
    async fn on_event(&self, event: &ResourceEvent) -> Result<()> {
        self.reload(event.kind.as_str())
            .await
            .with_context(|| format!("reload for {} failed", event.resource_id))
    }
}
