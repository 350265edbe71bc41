mod bootstrap_helpers;
mod cli_args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use pagebridge_core::ConfigSnapshot;
use pagebridge_events::ResourceEventBus;
use pagebridge_runtime::{
    DispatchHandler, FileResourceCatalog, InMemoryConversationStore, LoggingDispatchHandler,
    LoggingSupportNotifier, PlatformApiClient, PlatformApiConfig, ReloadController,
    SupportNotifier, TagNames, UpdateRouter, UpdateRouterConfig, WebhookDispatchHandler,
    WebhookSupportNotifier,
};
use pagebridge_socket::SocketConfig;
use tracing::{error, info};

use crate::bootstrap_helpers::{init_tracing, run_until_shutdown};
use crate::cli_args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run_cli(cli).await
}

async fn run_cli(cli: Cli) -> Result<()> {
    let snapshot = ConfigSnapshot::empty_handle();

    let tagger = Arc::new(PlatformApiClient::new(
        PlatformApiConfig {
            api_base: cli.platform_api_base.clone(),
            request_timeout_ms: cli.request_timeout_ms,
            ..PlatformApiConfig::default()
        },
        snapshot.clone(),
    )?);

    let notifier: Arc<dyn SupportNotifier> = match cli.notify_url.as_deref() {
        Some(url) => Arc::new(WebhookSupportNotifier::new(
            url,
            cli.notify_token.as_str(),
            cli.request_timeout_ms,
        )?),
        None => Arc::new(LoggingSupportNotifier),
    };
    let dispatcher: Arc<dyn DispatchHandler> = match cli.dispatch_url.as_deref() {
        Some(url) => Arc::new(WebhookDispatchHandler::new(url, cli.request_timeout_ms)?),
        None => Arc::new(LoggingDispatchHandler),
    };

    let mut router_config = UpdateRouterConfig::new(
        snapshot,
        Arc::new(InMemoryConversationStore::new()),
        tagger,
        notifier,
        dispatcher,
    );
    router_config.tag_names = TagNames {
        ai_handling: cli.ai_tag_name.clone(),
        human_support: cli.support_tag_name.clone(),
    };
    let router = Arc::new(UpdateRouter::new(router_config));

    let mut socket_template = SocketConfig::new(&cli.access_token, &cli.user_id, Vec::new());
    socket_template.endpoint = cli.socket_url.clone();
    socket_template.reconnect_delay = Duration::from_millis(cli.reconnect_delay_ms);

    let catalog = Arc::new(FileResourceCatalog::new(cli.resources_file.clone()));
    let controller = Arc::new(ReloadController::new(socket_template, catalog, router));

    let bus = ResourceEventBus::new();
    bus.subscribe_all(controller.clone());

    info!(
        user_id = %cli.user_id,
        resources_file = %cli.resources_file.display(),
        endpoint = %cli.socket_url,
        "pagebridge starting"
    );
    if let Err(start_error) = controller.start().await {
        // Stay up so a corrected catalog can be picked up by SIGHUP.
        error!(error = %format!("{start_error:#}"), "initial load failed");
    }

    let outcome = run_until_shutdown(&bus).await;
    controller.shutdown().await;
    info!(reloads = controller.reload_count(), "pagebridge stopped");
    outcome
}
