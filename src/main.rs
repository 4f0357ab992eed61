//! Callrec Server — Call Recording Acquisition Engine
//!
//! Main entry point that wires all crates together and runs the
//! acquisition fleet: download workers, the slot liveness sweeper and
//! the stuck-job monitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, fmt};

use callrec_core::config::AppConfig;
use callrec_core::error::AppError;
use callrec_core::traits::artifact::ArtifactStore;
use callrec_core::traits::cache::CacheProvider;
use callrec_core::traits::dispatch::JobDispatcher;
use callrec_core::traits::fetcher::RecordingFetcher;
use callrec_database::repositories::PgDownloadJobRepository;
use callrec_database::{DatabasePool, DownloadJobRepository};
use callrec_engine::{
    ChannelDispatcher, DownloadWorker, RecordingService, RetryBudget, StuckJobMonitor, WorkerRunner,
};
use callrec_engine::artifact::LocalArtifactStore;
use callrec_engine::fetcher::HttpRecordingFetcher;
use callrec_engine::scheduler::EngineScheduler;
use callrec_slots::sweeper::SlotSweeper;
use callrec_slots::{SlotAllocator, SlotAllocatorDispatch};

/// Submit bursts beyond this many undispatched jobs apply backpressure.
const DISPATCH_QUEUE_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() {
    let config = match load_configuration() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(config).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

/// Load configuration from file and environment
fn load_configuration() -> Result<AppConfig, AppError> {
    let env = std::env::var("CALLREC_ENV").unwrap_or_else(|_| "development".to_string());
    AppConfig::load(&env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .init();
        }
    }
}

/// Main server run function
async fn run(config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting Callrec v{}", env!("CARGO_PKG_VERSION"));

    // ── Step 1: Artifact data root ───────────────────────────────
    tokio::fs::create_dir_all(&config.worker.data_root)
        .await
        .map_err(|e| {
            AppError::internal(format!(
                "Failed to create data root '{}': {}",
                config.worker.data_root, e
            ))
        })?;

    // ── Step 2: Database connection + migrations ─────────────────
    tracing::info!("Connecting to database...");
    let db_pool = DatabasePool::connect(&config.database).await?;

    tracing::info!("Running database migrations...");
    callrec_database::migration::run_migrations(db_pool.pool()).await?;
    tracing::info!("Database migrations complete");

    // ── Step 3: Initialize cache ─────────────────────────────────
    tracing::info!(
        "Initializing cache (provider: {})...",
        config.cache.provider
    );
    let cache: Arc<dyn CacheProvider> =
        Arc::new(callrec_cache::CacheManager::new(&config.cache).await?);
    tracing::info!("Cache initialized");

    // ── Step 4: Initialize repository ────────────────────────────
    let repo: Arc<dyn DownloadJobRepository> =
        Arc::new(PgDownloadJobRepository::new(db_pool.pool().clone()));

    // ── Step 5: Initialize slot allocator ────────────────────────
    tracing::info!(
        "Initializing slot allocator (provider: {})...",
        config.slots.provider
    );
    let slots: Arc<dyn SlotAllocator> =
        Arc::new(SlotAllocatorDispatch::new(&config.slots).await?);
    tracing::info!("Slot allocator initialized");

    // ── Step 6: Initialize engine collaborators ──────────────────
    let retry = RetryBudget::new(Arc::clone(&cache), &config.monitor);
    let fetcher: Arc<dyn RecordingFetcher> =
        Arc::new(HttpRecordingFetcher::new(config.worker.fetch_timeout_seconds)?);
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(&config.worker.data_root));
    let (dispatcher, dispatch_rx) = ChannelDispatcher::channel(DISPATCH_QUEUE_CAPACITY);
    let dispatcher: Arc<dyn JobDispatcher> = Arc::new(dispatcher);

    // ── Step 7: Initialize acquisition service ───────────────────
    // The embedded admission surface (submit/status/cancel/list); request
    // interfaces are layered on top by the hosting deployment.
    let _service = Arc::new(RecordingService::new(
        Arc::clone(&repo),
        Arc::clone(&slots),
        Arc::clone(&artifacts),
        Arc::clone(&dispatcher),
        retry.clone(),
        config.slots.fail_open,
    ));
    tracing::info!("Recording service initialized");

    // ── Step 8: Shutdown channel ─────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Step 9: Start download workers ───────────────────────────
    let worker_handle = if config.worker.enabled {
        tracing::info!(
            concurrency = config.worker.concurrency,
            "Starting download workers..."
        );
        let worker = Arc::new(DownloadWorker::new(
            Arc::clone(&repo),
            Arc::clone(&slots),
            Arc::clone(&fetcher),
            Arc::clone(&artifacts),
            Arc::clone(&dispatcher),
            retry.clone(),
        ));
        let runner = WorkerRunner::new(worker, dispatch_rx, config.worker.concurrency);

        let worker_cancel = shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            runner.run(worker_cancel).await;
        });
        tracing::info!("Download workers started");
        Some(handle)
    } else {
        tracing::info!("Download workers disabled");
        drop(dispatch_rx);
        None
    };

    // ── Step 10: Start slot liveness sweeper ─────────────────────
    let sweeper = SlotSweeper::new(Arc::clone(&slots), config.slots.sweeper_interval_seconds);
    let sweeper_cancel = shutdown_rx.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper.run(sweeper_cancel).await;
    });
    tracing::info!("Slot sweeper started");

    // ── Step 11: Start cron scheduler ────────────────────────────
    let mut scheduler = EngineScheduler::new().await?;
    if config.monitor.enabled {
        let monitor = Arc::new(StuckJobMonitor::new(
            Arc::clone(&repo),
            retry.clone(),
            &config.monitor,
        ));
        scheduler
            .register_stuck_monitor(monitor, &config.monitor.cron)
            .await?;
    } else {
        tracing::info!("Stuck-job monitor disabled");
    }
    scheduler.start().await?;

    tracing::info!("Callrec server started");

    // ── Step 12: Graceful shutdown ───────────────────────────────
    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown...");
    let _ = shutdown_tx.send(true);

    // Workers drain in-flight downloads for up to 30s internally.
    if let Some(handle) = worker_handle {
        let _ = tokio::time::timeout(Duration::from_secs(35), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), sweeper_handle).await;

    scheduler.shutdown().await?;
    db_pool.close().await;

    tracing::info!("Callrec server shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
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
