//! Task-dispatch surface between the submit gate and the worker loop.

use async_trait::async_trait;

use crate::result::AppResult;
use crate::types::id::{DownloadJobId, TenantId};

/// Hands a job to some worker loop instance for processing.
///
/// The tenant id travels with the job id so the worker can release the
/// tenant's slot even when the job row has gone missing. The engine does
/// not care whether this is a channel into an in-process worker pool or
/// an external queue, only that delivery is at-least-once.
#[async_trait]
pub trait JobDispatcher: Send + Sync + std::fmt::Debug + 'static {
    /// Dispatch a job for processing.
    async fn dispatch(&self, tenant_id: TenantId, job_id: DownloadJobId) -> AppResult<()>;
}
