//! In-process dispatch channel between the submit gate and the worker
//! runner.

use async_trait::async_trait;
use tokio::sync::mpsc;

use callrec_core::error::AppError;
use callrec_core::result::AppResult;
use callrec_core::traits::dispatch::JobDispatcher;
use callrec_core::types::id::{DownloadJobId, TenantId};

/// Dispatch message: which tenant's job to process.
pub type DispatchMessage = (TenantId, DownloadJobId);

/// mpsc-backed dispatcher feeding the in-process [`WorkerRunner`].
///
/// [`WorkerRunner`]: crate::worker::WorkerRunner
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: mpsc::Sender<DispatchMessage>,
}

impl ChannelDispatcher {
    /// Create a dispatcher and the receiver half for the worker runner.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<DispatchMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl JobDispatcher for ChannelDispatcher {
    async fn dispatch(&self, tenant_id: TenantId, job_id: DownloadJobId) -> AppResult<()> {
        self.tx
            .send((tenant_id, job_id))
            .await
            .map_err(|_| AppError::service_unavailable("Worker dispatch channel is closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_delivers_message() {
        let (dispatcher, mut rx) = ChannelDispatcher::channel(4);
        let tenant = TenantId::new();
        let job = DownloadJobId::new();

        dispatcher.dispatch(tenant, job).await.unwrap();
        assert_eq!(rx.recv().await, Some((tenant, job)));
    }

    #[tokio::test]
    async fn test_dispatch_fails_when_runner_gone() {
        let (dispatcher, rx) = ChannelDispatcher::channel(4);
        drop(rx);
        assert!(dispatcher
            .dispatch(TenantId::new(), DownloadJobId::new())
            .await
            .is_err());
    }
}
