//! Cron scheduler for periodic engine maintenance.

use std::sync::Arc;

use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info};

use callrec_core::error::AppError;

use crate::monitor::StuckJobMonitor;

/// Cron-based scheduler for the engine's periodic tasks.
pub struct EngineScheduler {
    scheduler: JobScheduler,
}

impl std::fmt::Debug for EngineScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineScheduler").finish()
    }
}

impl EngineScheduler {
    /// Create a new scheduler.
    pub async fn new() -> Result<Self, AppError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| AppError::internal(format!("Failed to create scheduler: {e}")))?;
        Ok(Self { scheduler })
    }

    /// Register the stuck-job monitor sweep.
    pub async fn register_stuck_monitor(
        &self,
        monitor: Arc<StuckJobMonitor>,
        cron: &str,
    ) -> Result<(), AppError> {
        let job = CronJob::new_async(cron, move |_uuid, _lock| {
            let monitor = Arc::clone(&monitor);
            Box::pin(async move {
                debug!("Running stuck-job sweep");
                if let Err(e) = monitor.sweep(None).await {
                    error!(error = %e, "Stuck-job sweep failed");
                }
            })
        })
        .map_err(|e| AppError::internal(format!("Failed to create stuck_monitor schedule: {e}")))?;

        self.scheduler
            .add(job)
            .await
            .map_err(|e| AppError::internal(format!("Failed to add stuck_monitor schedule: {e}")))?;

        info!(cron, "Registered: stuck_monitor");
        Ok(())
    }

    /// Start the scheduler.
    pub async fn start(&self) -> Result<(), AppError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| AppError::internal(format!("Failed to start scheduler: {e}")))?;
        info!("Cron scheduler started");
        Ok(())
    }

    /// Shut the scheduler down.
    pub async fn shutdown(&mut self) -> Result<(), AppError> {
        self.scheduler
            .shutdown()
            .await
            .map_err(|e| AppError::internal(format!("Failed to shutdown scheduler: {e}")))?;
        info!("Cron scheduler shut down");
        Ok(())
    }
}
