//! Signal Monitor - streaming channel outage detection and alerting.
//!
//! Polls channel sources, confirms outages after consecutive failed checks and
//! sends batched notifications when channels go down or come back.

mod config;
mod db;
mod notify;
mod sampler;
mod scheduler;
mod web;

use config::ServerConfig;
use db::{MaintenanceWindow, Source, Store};
use notify::Notifier;
use sampler::HttpSampler;
use scheduler::{Scheduler, SchedulerOptions};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("signal_monitor=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting Signal Monitor on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add an example source if none exist
    if store.get_sources()?.is_empty() {
        tracing::info!("Adding example source (inactive)");
        store.add_source(&Source {
            id: "example".to_string(),
            name: "Example Server".to_string(),
            base_url: "http://127.0.0.1:8089".to_string(),
            username: String::new(),
            password: String::new(),
            active: false,
            maintenance: MaintenanceWindow::default(),
            exclude_pattern: None,
        })?;
    }

    // Start scheduler
    let sampler = Arc::new(HttpSampler::new(cfg.sampler_timeout)?);
    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        sampler,
        Notifier::new(cfg.notify_timeout)?,
        SchedulerOptions::from(&cfg),
    ));
    let poll_loop = scheduler.start();

    // Start web server
    let server = Server::new(cfg, store);
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    scheduler.stop().await;
    poll_loop.await?;

    Ok(())
}
