//! Stuck-job monitor.
//!
//! Rows can wedge in an active status when a worker dies between state
//! transitions or a dispatch is lost. The monitor marks such rows failed
//! and charges the retry budget; once the budget is spent, the submit
//! gate fail-fasts with an `Offline` outcome instead of feeding more
//! jobs to a worker fleet that keeps eating them.

use std::sync::Arc;

use chrono::{Duration, Utc};

use tracing::{info, warn};

use callrec_core::config::monitor::MonitorConfig;
use callrec_core::result::AppResult;
use callrec_core::types::id::TenantId;
use callrec_database::repository::DownloadJobRepository;
use callrec_entity::download::DownloadStatus;

use crate::retry::RetryBudget;

/// Periodic sweep that fails abandoned jobs.
#[derive(Debug, Clone)]
pub struct StuckJobMonitor {
    repo: Arc<dyn DownloadJobRepository>,
    retry: RetryBudget,
    stuck_after_seconds: i64,
}

impl StuckJobMonitor {
    /// Create a monitor from configuration.
    pub fn new(
        repo: Arc<dyn DownloadJobRepository>,
        retry: RetryBudget,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            repo,
            retry,
            stuck_after_seconds: config.stuck_after_seconds,
        }
    }

    /// Fail every stuck job, optionally scoped to one tenant. A job is
    /// stuck when it has been `running` longer than the threshold (or is
    /// `running` with no start stamp at all), or has sat `queued` longer
    /// than the threshold without a worker picking it up. Returns the
    /// number of jobs marked failed.
    pub async fn sweep(&self, tenant_id: Option<TenantId>) -> AppResult<u64> {
        let threshold = Utc::now() - Duration::seconds(self.stuck_after_seconds);
        let stuck = self.repo.find_stuck(tenant_id, threshold, threshold).await?;

        let mut marked = 0u64;
        for job in stuck {
            let reason = match job.status {
                DownloadStatus::Running => format!(
                    "stuck: running for more than {}s without completing",
                    self.stuck_after_seconds
                ),
                _ => format!(
                    "stuck: queued for more than {}s without starting",
                    self.stuck_after_seconds
                ),
            };

            self.repo.mark_failed(job.id, &reason, None).await?;
            // Each stuck cycle spends retry budget; three in a window and
            // the submit gate stops accepting this recording.
            if let Err(e) = self
                .retry
                .record_failure(job.tenant_id, &job.recording_key)
                .await
            {
                warn!(job_id = %job.id, error = %e, "Failed to charge retry budget for stuck job");
            }
            warn!(
                tenant_id = %job.tenant_id,
                job_id = %job.id,
                recording_key = %job.recording_key,
                status = %job.status,
                "Marked stuck job failed"
            );
            marked += 1;
        }

        if marked > 0 {
            info!(marked, "Stuck-job sweep complete");
        }
        Ok(marked)
    }
}
