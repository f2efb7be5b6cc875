//! JobBus Worker - Main entry point
//!
//! Claims and executes jobs until SIGINT/SIGTERM, alongside the lease
//! reclaimer and the interval scheduler.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jobbus_core::{
    bus::JobBus,
    config::Config,
    jobs::{
        EchoHandler, HandlerRegistry, JobStore, LeaseReclaimer, PgJobStore, PingHandler, Scheduler,
        WorkerConfig, WorkerPool,
    },
    policy::{PolicyEnforcer, PolicyRegistry},
    telemetry::{init_logging, init_metrics},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = match std::env::var("JOBBUS_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };

    init_logging(&config.logging)?;
    config.validate()?;
    init_metrics(&config.metrics)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker_id = %config.worker.worker_id,
        "Starting JobBus worker"
    );

    // Connect to database
    let pg = PgJobStore::connect(&config.database).await?;
    pg.migrate().await?;
    tracing::info!("Connected to database, migrations applied");

    let store: Arc<dyn JobStore> = Arc::new(pg);
    let bus = Arc::new(JobBus::with_backoff(store.clone(), config.retry.backoff.clone()));

    let enforcer = PolicyEnforcer::new(Arc::new(PolicyRegistry::new(config.agents.clone())));
    let handlers = Arc::new(HandlerRegistry::new().register(PingHandler).register(EchoHandler));
    tracing::info!(job_types = ?handlers.job_types(), agents = enforcer.registry().len(), "Handlers registered");

    let token = CancellationToken::new();

    // Worker slots
    let pool = Arc::new(WorkerPool::new(
        WorkerConfig::from(&config.worker),
        bus.claims().clone(),
        bus.retries().clone(),
        enforcer,
        handlers,
        bus.events().clone(),
    ));
    let workers = pool.start(token.clone());

    // Lease reclaimer
    let reclaimer = LeaseReclaimer::new(store.clone(), bus.retries().clone(), config.lease_timeout());
    let reclaim_period = Duration::from_millis(config.worker.reclaim_interval_ms);
    let reclaim_task = {
        let token = token.clone();
        tokio::spawn(async move { reclaimer.run(reclaim_period, token).await })
    };

    // Interval schedules
    let scheduler = Scheduler::new(bus.clone(), config.schedules.clone());
    let schedule_tick = Duration::from_millis(config.worker.schedule_tick_ms);
    let schedule_task = {
        let token = token.clone();
        tokio::spawn(async move { scheduler.run(schedule_tick, token).await })
    };

    shutdown_signal().await;

    let stats = workers.stats().clone();
    workers.shutdown().await;
    let (reclaim, schedule) = tokio::join!(reclaim_task, schedule_task);
    if let Err(e) = reclaim.and(schedule) {
        tracing::error!(error = %e, "Background task panicked");
    }

    tracing::info!(
        processed = stats.processed(),
        succeeded = stats.succeeded(),
        failed = stats.failed(),
        "Worker shutdown complete"
    );

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
