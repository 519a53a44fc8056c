//! Whatsend - Campaign dispatcher entry point

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use whatsend_common::config::{Config, LoggingConfig};
use whatsend_core::{CampaignDispatcher, CloudApiClient, DispatchEvent, ScheduledCampaignWorker};
use whatsend_storage::{
    DatabasePool, DbCampaignMessageRepository, DbCampaignRepository, DbContactRepository,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    init_logging(&config.logging);

    info!("Starting Whatsend campaign dispatcher...");

    // Initialize database
    let db_pool = DatabasePool::new(&config.database).await?;
    info!("Database connection established");

    // Run migrations
    db_pool.migrate().await?;
    info!("Database migrations completed");

    db_pool.health_check().await?;

    // Repositories
    let campaigns = Arc::new(DbCampaignRepository::new(db_pool.clone()));
    let messages = Arc::new(DbCampaignMessageRepository::new(db_pool.clone()));
    let contacts = Arc::new(DbContactRepository::new(db_pool.clone()));

    // WhatsApp Cloud API client serves both sends and template lookups
    let client = Arc::new(CloudApiClient::new(&config.whatsapp)?);

    let dispatcher = CampaignDispatcher::new(
        config.dispatch.clone(),
        campaigns.clone(),
        messages,
        contacts,
        client.clone(),
        client,
    );

    let shutdown = CancellationToken::new();

    // Log dispatch events
    let events_handle = {
        let mut events = dispatcher.subscribe();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(event) => log_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Dispatch event logger lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    // Start scheduled campaign worker if enabled
    let scheduler_handle = if config.scheduler.enabled {
        let worker = ScheduledCampaignWorker::new(campaigns, dispatcher.clone(), &config.scheduler);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            worker.run(shutdown).await;
        }))
    } else {
        info!("Scheduled campaign worker disabled");
        None
    };

    info!("Whatsend started successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();

    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!("Scheduled campaign worker panicked: {}", e);
        }
    }
    events_handle.abort();

    info!("Whatsend shutdown complete");

    Ok(())
}

fn log_event(event: &DispatchEvent) {
    match event {
        DispatchEvent::Started {
            campaign_id,
            total_messages,
            total_batches,
        } => info!(
            campaign_id = %campaign_id,
            total_messages,
            total_batches,
            "Campaign dispatch started"
        ),
        DispatchEvent::Progress(progress) => info!(
            campaign_id = %progress.campaign_id,
            batch = progress.batch_index,
            total_batches = progress.total_batches,
            sent = progress.sent,
            failed = progress.failed,
            "Campaign batch finished"
        ),
        DispatchEvent::Completed { campaign_id, stats } => info!(
            campaign_id = %campaign_id,
            sent = stats.sent,
            failed = stats.failed,
            "Campaign dispatch completed"
        ),
        DispatchEvent::Failed {
            campaign_id, error, ..
        } => error!(campaign_id = %campaign_id, "Campaign dispatch failed: {}", error),
        DispatchEvent::Stopped { campaign_id, stats } => info!(
            campaign_id = %campaign_id,
            sent = stats.sent,
            cancelled = stats.cancelled,
            "Campaign dispatch stopped"
        ),
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true).with_level(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
