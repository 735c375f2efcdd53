pub mod config;
pub mod engine;
pub mod error;
pub mod hub;
pub mod link;
pub mod metrics;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod settings;
pub mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use config::AppConfig;
use engine::Engine;
use hub::BroadcastHub;
use link::Supervisor;
use session::{SessionContext, UserDirectory};
use settings::SettingsStore;

/// Wires the shared stores, hub and user directory described by `config`.
pub fn build_context(config: &AppConfig) -> SessionContext {
    let settings = SettingsStore::new(config.connection.clone(), config.calibration.clone());
    let engine = Engine::new(settings, BroadcastHub::new(config.hub_capacity));

    let directory = Arc::new(UserDirectory::with_users(
        config
            .users
            .iter()
            .map(|(name, role)| (name.clone(), *role)),
    ));
    SessionContext::new(engine, directory.clone(), directory)
}

pub async fn run() -> Result<()> {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    log::info!("msr-relay starting up...");

    let config = AppConfig::load()?;
    let ctx = build_context(&config);
    log::info!(
        "Instrument endpoint {}, {} configured users",
        config.connection.address(),
        config.users.len()
    );

    let mut supervisor = Supervisor::new(ctx.engine.clone());
    supervisor.start()?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => log::info!("Shutdown signal received"),
                Err(err) => log::error!("Failed to listen for Ctrl-C: {err}"),
            }
            shutdown.cancel();
        });
    }

    let served = server::serve(config.listen_addr, ctx, shutdown.clone()).await;
    shutdown.cancel();

    supervisor
        .stop()
        .await
        .context("Failed to stop instrument supervisor")?;
    log::info!("msr-relay stopped");
    served
}
