use std::sync::Arc;

use anyhow::{Context, Result};
use callrelay_browser::WebDriverSession;
use callrelay_core::telemetry::{init_telemetry, TelemetryConfig};
use callrelay_core::{MonitorConfig, SharedBrowser, UnknownRegion};
use callrelay_notify::TelegramNotifier;
use callrelay_worker::{Monitor, StopReason};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    // Values from .env do not override the real environment
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG: Full filter directive
    // - LOG_LEVEL: Level for the callrelay crates (default: info)
    init_telemetry(TelemetryConfig::from_env().with_service_name("callrelay"));

    tracing::info!("callrelay starting...");

    let config = MonitorConfig::from_env();
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        feed = %config.site.feed_url,
        webdriver = %config.webdriver.endpoint,
        capacity = config.pool.capacity,
        poll_secs = config.tracker.poll_interval.as_secs(),
        "Configuration loaded"
    );

    let session = Arc::new(
        WebDriverSession::connect(&config.webdriver)
            .await
            .context("Failed to start browser session")?,
    );
    let notifier = Arc::new(
        TelegramNotifier::new(config.dispatch.clone()).context("Failed to create notifier")?,
    );

    let monitor = Monitor::new(
        config,
        SharedBrowser::new(session.clone()),
        notifier,
        Arc::new(UnknownRegion),
    )
    .context("Failed to create monitor")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut run = tokio::spawn(monitor.run(shutdown_rx));

    // Run the monitor (blocks until shutdown)
    let reason = tokio::select! {
        result = &mut run => result.context("Monitor task panicked")?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            let _ = shutdown_tx.send(true);
            run.await.context("Monitor task panicked")?
        }
    };

    if let Err(e) = session.quit().await {
        tracing::warn!(error = %e, "Browser session did not close cleanly");
    }

    tracing::info!(%reason, "Monitor shutdown complete");
    match reason {
        StopReason::Shutdown => Ok(()),
        other => anyhow::bail!("monitor stopped: {}", other),
    }
}
