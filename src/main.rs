mod gateway;
mod order;
mod server;
mod settings;
mod settle;
mod webhook_server;

use crate::gateway::retry::TokioSleeper;
use crate::gateway::{PaymentGateway, SettleGateway};
use crate::order::database::RedbOrderStore;
use crate::server::AppState;
use crate::settle::SettleProvider;
use anyhow::Result;
use std::{fs, path::Path, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from config.toml and environment
    let cfg = settings::Config::load();

    // Logging; the gateway's own trace target follows the `logging` switch
    let mut filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    if !cfg.settle.logging {
        filter = filter.add_directive("settle=off".parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("Starting Settle payment gateway");

    if let Some(parent) = Path::new(&cfg.database_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(RedbOrderStore::new(&cfg.database_path)?);
    tracing::info!(
        path = %cfg.database_path,
        orders = store.order_count()?,
        "Order store opened"
    );

    let provider = SettleProvider::new(cfg.settle.clone())?;
    let settings = provider.settings();
    tracing::info!(
        test_mode = settings.test_mode,
        server = %settings.server_base_url(),
        autocapture = settings.autocapture,
        "Settle provider configured"
    );

    let gateway = SettleGateway::new(
        cfg.settle.clone(),
        cfg.store_currency.clone(),
        provider.client(),
        store.clone(),
        Arc::new(TokioSleeper),
    );

    // Payment routes answer 503 until the configuration is fixed
    match gateway.validate_configuration() {
        Ok(()) => tracing::info!(gateway = gateway.id(), "Gateway enabled"),
        Err(e) => tracing::warn!(error = %e, "Gateway disabled: invalid configuration"),
    }

    let state = AppState {
        gateway: Arc::new(gateway),
        store,
    };
    server::run_server(cfg.server_port, state).await?;

    Ok(())
}
