//! herald webhook dispatcher.
//!
//! Runs the submission API and the dispatch loops in one process. Both
//! share the database pool and stop together on ctrl-c or SIGTERM: the
//! server stops accepting requests, the dispatchers finish their in-flight
//! batches, and the pool is closed last.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_api::{AppState, Config};
use herald_core::{
    storage::{schema, Storage},
    Clock, PayloadSigner, RealClock,
};
use herald_delivery::{DeliveryEngine, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DB_CONNECT_ATTEMPTS: u32 = 10;
const DB_CONNECT_DELAY: Duration = Duration::from_secs(3);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting herald webhook dispatcher");

    let config = Config::load()?;
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        worker_count = config.worker_count,
        batch_size = config.batch_size,
        poll_interval_ms = config.poll_interval_ms,
        max_attempts = config.max_attempts,
        "configuration loaded"
    );
    if config.uses_development_secret() {
        warn!("HMAC_SECRET is not set, signing with the development secret");
    }

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    schema::apply(&db_pool).await.context("Failed to apply database schema")?;
    info!("database schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let storage = Arc::new(Storage::new(db_pool.clone(), clock.clone()));
    let signer = PayloadSigner::new(&config.hmac_secret).context("Invalid HMAC secret")?;

    let delivery_config = config.to_delivery_config();
    let engine = Arc::new(
        DeliveryEngine::with_postgres(
            storage.clone(),
            signer,
            delivery_config.clone(),
            clock.clone(),
        )
        .context("Failed to create delivery engine")?,
    );

    let shutdown = CancellationToken::new();
    let mut workers =
        WorkerPool::new(engine, delivery_config.clone(), clock.clone(), shutdown.clone());
    workers.spawn_workers().await;

    let addr = config.parse_server_addr()?;
    let server = tokio::spawn({
        let state = AppState::new(storage, clock);
        let shutdown = shutdown.clone();
        let request_timeout = config.api_request_timeout();
        async move {
            let result = herald_api::start_server(
                state,
                addr,
                request_timeout,
                shutdown.clone().cancelled_owned(),
            )
            .await;
            // An early server exit also stops the dispatchers.
            shutdown.cancel();
            result
        }
    });

    info!(addr = %addr, "herald is ready to accept events");

    tokio::select! {
        () = herald_api::shutdown_signal() => {
            info!("shutdown signal received, starting graceful shutdown");
        },
        () = shutdown.cancelled() => {
            warn!("http server exited before shutdown was requested");
        },
    }
    shutdown.cancel();

    match server.await {
        Ok(Ok(())) => info!("http server stopped"),
        Ok(Err(e)) => error!(error = %e, "http server failed"),
        Err(e) => error!(error = %e, "http server task panicked"),
    }

    if let Err(e) = workers.shutdown_graceful(delivery_config.shutdown_timeout).await {
        error!(error = %e, "dispatcher shutdown incomplete");
    }

    db_pool.close().await;
    info!("database connections closed");

    info!("herald shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,herald=debug,tower_http=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(config.database_acquire_timeout())
            .idle_timeout(Duration::from_secs(10))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if attempt < DB_CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    max_attempts = DB_CONNECT_ATTEMPTS,
                    retry_in_secs = DB_CONNECT_DELAY.as_secs(),
                    error = %e,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(DB_CONNECT_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
