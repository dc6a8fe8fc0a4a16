//! Bastion resilience service.
//!
//! Wires the delivery engine, the failover session store and the circuit
//! breaker registry together behind the operational HTTP surface, and
//! coordinates graceful startup and shutdown.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use bastion_api::{shutdown_signal, start_server, AppState, Config, DatabaseCheck};
use bastion_circuit::{CircuitBreakerManager, CircuitState};
use bastion_core::{Clock, RealClock};
use bastion_delivery::{DeliveryEngine, PostgresDeliveryStorage};
use bastion_session::{
    MemorySessionStore, PostgresSessionStore, ReadinessCheck, ResilientSessionStore,
};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting bastion resilience service");

    let config = Config::load()?;
    let addr = config.parse_server_addr()?;
    info!(
        database_url = %config.database_url_masked(),
        server_addr = %addr,
        max_connections = config.database_max_connections,
        worker_pool_size = config.worker_pool_size,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    sqlx::migrate!("./migrations")
        .run(&db_pool)
        .await
        .context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());

    let mut engine = DeliveryEngine::new(&db_pool, config.to_delivery_config()?, clock.clone())
        .context("Failed to build delivery engine")?;
    engine.start().await.context("Failed to start delivery engine")?;
    let engine = Arc::new(engine);

    let sessions = Arc::new(
        ResilientSessionStore::new(
            PostgresSessionStore::new(db_pool.clone(), clock.clone()),
            MemorySessionStore::new(clock.clone()),
            config.to_resilient_config(),
            clock.clone(),
        )
        .await
        .context("Failed to initialize session store")?,
    );
    info!(mode = sessions.mode().as_str(), "Session store initialized");

    let circuits = Arc::new(
        CircuitBreakerManager::with_clock(config.to_circuit_config(), clock.clone()).with_metrics(
            Arc::new(|key: &str, state: CircuitState| {
                info!(provider = key, state = %state, "circuit state changed");
            }),
        ),
    );

    let sweeper = spawn_stranded_sweep(engine.clone(), config.stranded_retry_grace());

    let checks: Vec<Arc<dyn ReadinessCheck>> =
        vec![Arc::new(DatabaseCheck::new(db_pool.clone())), sessions.clone()];
    let state = AppState::new(
        Arc::new(PostgresDeliveryStorage::new(db_pool.clone())),
        circuits,
        checks,
        clock,
    );

    info!(addr = %addr, "Bastion is ready");

    let request_timeout = Duration::from_secs(config.request_timeout);
    if let Err(e) = start_server(state, addr, request_timeout, shutdown_signal()).await {
        error!(error = %e, "Server failed");
    }

    stop_stranded_sweep(sweeper).await;

    match Arc::try_unwrap(engine) {
        Ok(engine) => {
            if let Err(e) = engine.shutdown().await {
                warn!(error = %e, "Delivery engine did not stop cleanly");
            }
        },
        Err(_) => warn!("Delivery engine still shared at shutdown, skipping graceful stop"),
    }

    let stats = sessions.stats();
    info!(
        degradations = stats.degradations,
        recoveries = stats.recoveries,
        "Session store statistics at shutdown"
    );

    db_pool.close().await;
    info!("Database connections closed");

    info!("Bastion shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,bastion=debug,tower_http=debug"))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
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
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Periodically re-enqueues retries whose job was lost between settling the
/// attempt and enqueueing the next one.
fn spawn_stranded_sweep(engine: Arc<DeliveryEngine>, grace: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(grace);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.requeue_stranded(grace).await {
                warn!(error = %e, "stranded retry sweep failed");
            }
        }
    })
}

/// Cancels the sweep. Returns false if it had already died of a panic.
async fn stop_stranded_sweep(sweeper: JoinHandle<()>) -> bool {
    sweeper.abort();
    match sweeper.await {
        Err(e) if !e.is_cancelled() => {
            warn!(error = %e, "Stranded retry sweep ended abnormally");
            false
        },
        _ => {
            info!("Stranded retry sweep stopped");
            true
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn running_sweep_stops_cleanly() {
        let sweeper = tokio::spawn(std::future::pending::<()>());
        assert!(stop_stranded_sweep(sweeper).await);
    }

    #[tokio::test]
    async fn panicked_sweep_is_reported() {
        let sweeper = tokio::spawn(async { panic!("sweep crashed") });
        while !sweeper.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(!stop_stranded_sweep(sweeper).await);
    }
}
