//! Fleet Relayer - multi-chain transaction relay service
//!
//! Bootstraps one relayer fleet per enabled chain and serves the request API.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use fleet_relayer::api;
use fleet_relayer::chain::{ChainProvider, NetworkService};
use fleet_relayer::config::Settings;
use fleet_relayer::coordination::RelayEngine;
use fleet_relayer::metrics::{self, MetricsServer};
use fleet_relayer::notify;
use fleet_relayer::relayer::RelayerManager;
use fleet_relayer::state::{InMemoryTransactionStore, StateManager, TransactionStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Fleet Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Request store
    let store: Arc<dyn TransactionStore> = match &settings.database {
        Some(database) => {
            let state_manager = StateManager::new(database).await?;
            info!("Database connection established");
            state_manager.run_migrations().await?;
            info!("Database migrations complete");
            Arc::new(state_manager)
        }
        None => {
            warn!("No database configured; requests are kept in memory only");
            Arc::new(InMemoryTransactionStore::new())
        }
    };

    let notifier = notify::from_config(&settings.alerts)?;

    // Bootstrap one fleet per chain; a chain that fails is left out
    let mut engine = RelayEngine::new(store.clone(), settings.relayer.max_concurrent_txs);
    for (name, chain) in settings.enabled_chains() {
        let network: Arc<dyn NetworkService> = match ChainProvider::new(chain.clone()) {
            Ok(provider) => Arc::new(provider),
            Err(e) => {
                error!("Chain {} excluded: {}", name, e);
                continue;
            }
        };

        match RelayerManager::bootstrap(chain.clone(), network.clone(), notifier.clone()).await {
            Ok(manager) => engine.add_chain(Arc::new(manager), network),
            Err(e) => error!("Chain {} excluded: {}", name, e),
        }
    }

    if engine.chain_ids().is_empty() {
        anyhow::bail!("No chain could be bootstrapped");
    }

    let engine = Arc::new(engine);
    engine.start().await;
    engine.recover().await?;

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let engine = engine.clone();
        async move {
            if let Err(e) = api::run_server(config, engine).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let engine = engine.clone();
        let interval = settings.relayer.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                for (chain_id, healthy) in engine.health().await {
                    metrics::record_chain_health(chain_id, healthy);
                    if !healthy {
                        warn!("Chain {} health check failed", chain_id);
                    }
                }

                if let Err(e) = engine.store().health_check().await {
                    warn!("Store health check failed: {}", e);
                }
            }
        }
    });

    info!("Fleet Relayer is running on chains {:?}", engine.chain_ids());
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    engine.stop().await;

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Fleet Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,fleet_relayer=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
