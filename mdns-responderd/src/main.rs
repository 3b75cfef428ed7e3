mod config;
mod engine_thread;
mod mdns;
mod registry;

use anyhow::{Context, Result};
use mdns_core::Engine;
use shared::protocol::{default_log_filter, DEFAULT_CONFIG_PATH};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine_thread::EngineHandle;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(default_log_filter("mdns-responderd"))
            }),
        )
        .init();

    tracing::info!("Starting mdns-responderd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let hostname = config.hostname()?;
    let engine = Engine::bind(config.engine.clone(), &hostname)
        .context("Failed to bind mDNS sockets")?;
    for interface in engine.interfaces() {
        tracing::info!("Using interface {} (index {})", interface.name, interface.index);
    }

    // Start engine thread
    let engine = EngineHandle::spawn(engine);
    let advertiser_events = engine.subscribe().await?;
    let browser_events = engine.subscribe().await?;

    let advertised = mdns::advertise::register_services(&engine, &config.services).await?;

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    let advertiser_cancel = cancel.clone();
    let advertiser_services = advertised.clone();
    let advertiser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::advertise::run_advertiser(
            advertiser_events,
            advertiser_services,
            advertiser_cancel,
        )
        .await
        {
            tracing::error!("Advertiser error: {}", e);
        }
    });

    // Spawn mDNS browser task
    let (browser_tx, browser_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_engine = engine.clone();
    let browse_types = config.browse.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(
            browser_engine,
            browser_events,
            browse_types,
            browser_tx,
            browser_cancel,
        )
        .await
        {
            tracing::error!("mDNS browser error: {:#}", e);
        }
    });

    // Spawn registry task
    let registry_cancel = cancel.clone();
    let registry_handle = tokio::spawn(async move {
        if let Err(e) = registry::run(browser_rx, registry_cancel).await {
            tracing::error!("Registry error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();
    let _ = tokio::join!(advertiser_handle, browser_handle, registry_handle);

    if let Err(e) = mdns::advertise::unregister_services(&engine, &advertised).await {
        tracing::error!("Failed to unregister services: {:#}", e);
    }

    // Shutdown engine thread, flushing goodbyes
    if let Err(e) = engine.shutdown().await {
        tracing::error!("Failed to shutdown engine: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
