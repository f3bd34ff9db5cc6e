use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use telemetry_tracker_api::{app, observability::ObservabilityProvider, AppState};
use telemetry_tracker_storage::{postgres, PgEventStore};
use tokio::sync::Notify;
use tracing::{error, info, warn};

mod config;
mod shutdown;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::load()?;

    // Initialize observability
    let provider = ObservabilityProvider::init(config.observability.clone())
        .await
        .context("failed to initialize observability")?;
    provider.install_global()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = ?provider.mode(),
        "Starting telemetry tracker"
    );

    if config.database.url.is_none() && config.database.password.is_empty() {
        warn!("DB_PASSWORD is empty");
    }

    let result = run(&config, &provider).await;
    if let Err(error) = &result {
        error!(error = ?error, "Server stopped with an error");
    }

    if let Err(error) = provider
        .shutdown(config.observability.shutdown_timeout())
        .await
    {
        error!(
            failures = error.failures().len(),
            error = %error,
            "Telemetry shutdown incomplete"
        );
    }

    result
}

async fn run(config: &config::Config, provider: &ObservabilityProvider) -> Result<()> {
    // Initialize storage
    let store = PgEventStore::connect(&config.postgres())
        .await
        .context("failed to connect to database")?;
    info!(pool = %postgres::pool_status(store.pool()), "Database pool initialized");

    if config.database.run_migrations {
        postgres::migrate(store.pool()).await?;
    }

    let state = AppState::from_provider(Arc::new(store.clone()), provider);
    let app = app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Listening on {}", addr);

    let stopping = Arc::new(Notify::new());
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let stopping = stopping.clone();
        async move {
            shutdown::signal().await;
            stopping.notify_one();
        }
    });
    let mut server = tokio::spawn(async move { server.await });

    tokio::select! {
        result = &mut server => result??,
        _ = stopping.notified() => {
            info!(grace = ?config.shutdown_grace(), "Draining in-flight requests");
            match tokio::time::timeout(config.shutdown_grace(), &mut server).await {
                Ok(result) => result??,
                Err(_) => {
                    warn!("Shutdown grace period elapsed, aborting remaining requests");
                    server.abort();
                }
            }
        }
    }
    info!("Server stopped");

    store.close().await;
    Ok(())
}
