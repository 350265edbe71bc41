use anyhow::{Context, Result};
use pagebridge_events::{ResourceEvent, ResourceEventBus, ResourceEventKind};
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Resource id carried by operator-triggered bulk reloads.
pub(crate) const BULK_RELOAD_RESOURCE_ID: &str = "*";

pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

/// Blocks until ctrl-c. On Unix, every SIGHUP emits a bulk reload event.
pub(crate) async fn run_until_shutdown(bus: &ResourceEventBus) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup =
            signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("failed to listen for ctrl-c")?;
                    info!("shutdown requested");
                    return Ok(());
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading managed resources");
                    emit_bulk_reload(bus).await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = bus;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
        info!("shutdown requested");
        Ok(())
    }
}

pub(crate) async fn emit_bulk_reload(bus: &ResourceEventBus) {
    let report = bus
        .emit(ResourceEvent::new(
            ResourceEventKind::Reloaded,
            BULK_RELOAD_RESOURCE_ID,
        ))
        .await;
    info!(
        listeners = report.listeners,
        failed = report.failed,
        "bulk reload delivered"
    );
}
