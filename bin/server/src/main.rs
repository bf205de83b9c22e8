use rootcause::Report;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tether_integration::{
    BootstrapWorker, ChannelQueue, Cipher, EventBus, Lifecycle, ProviderRegistry, WebhookIngestor,
};
use tether_scheduler::{HealthSweeper, Scheduler};
use tether_server::config::ServerConfig;
use tether_server::db::PgStore;
use tether_server::error::StartupError;
use tether_server::routes::{AppState, router};
use tokio::sync::{broadcast, watch};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Capacity of the lifecycle event channel.
const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> Result<(), Report<StartupError>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().map_err(StartupError::configuration)?;
    tracing::info!(?config, "Loaded configuration");

    let cipher =
        Cipher::from_base64_key(&config.encryption_key).map_err(StartupError::configuration)?;
    let keys = config.provider_keys().map_err(StartupError::configuration)?;
    let registry = ProviderRegistry::builtin(&keys, config.lifecycle.provider_timeout())
        .map_err(StartupError::configuration)?;
    let clients = config
        .client_credentials(&registry)
        .map_err(StartupError::configuration)?;
    config
        .scheduler
        .validate()
        .map_err(StartupError::configuration)?;
    tracing::info!(providers = ?keys, "Registered providers");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .map_err(|e| StartupError::Database {
            details: e.to_string(),
        })?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| StartupError::Migration {
            details: e.to_string(),
        })?;

    let events = EventBus::new(EVENT_CAPACITY);
    let (queue, tasks) = ChannelQueue::new(config.bootstrap.queue_capacity);
    let store = Arc::new(PgStore::new(pool));
    let lifecycle = Lifecycle::new(
        store.clone(),
        Arc::new(cipher),
        Arc::new(registry),
        Arc::new(queue),
    )
    .with_clients(clients)
    .with_settings(config.lifecycle.clone())
    .with_events(events.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = HealthSweeper::new(lifecycle.clone(), config.scheduler.clone());
    let worker =
        tokio::spawn(BootstrapWorker::new(lifecycle.clone(), tasks, shutdown_rx.clone()).run());
    let scheduler = tokio::spawn(Scheduler::new(sweeper.clone(), shutdown_rx).run());
    tokio::spawn(log_events(events.subscribe()));

    let state = AppState {
        ingestor: WebhookIngestor::new(store, lifecycle.registry().clone()),
        sweeper,
        lifecycle,
    };

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .map_err(|e| StartupError::Bind {
            addr: config.listen_addr.clone(),
            details: e.to_string(),
        })?;
    tracing::info!("Listening on http://{}", config.listen_addr);

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone()))
        .await
        .map_err(|e| StartupError::Server {
            details: e.to_string(),
        })?;

    shutdown_tx.send_replace(true);
    for (name, task) in [("bootstrap worker", worker), ("scheduler", scheduler)] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "background task ended abnormally");
        }
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C and tells background tasks to stop.
async fn shutdown_signal(shutdown: watch::Sender<bool>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
    shutdown.send_replace(true);
}

async fn log_events(mut events: broadcast::Receiver<tether_integration::LifecycleEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => tracing::debug!(?event, "lifecycle event"),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "lifecycle event log fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
