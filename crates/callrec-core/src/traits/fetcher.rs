//! Opaque recording fetch trait for the telephony provider.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Failure classification for a provider fetch.
///
/// Recoverable errors (timeouts, 5xx) are eligible for bounded retry via
/// resubmission; fatal errors (auth rejection, permanently missing media)
/// are not retried even when retry budget remains.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transient network or upstream failure; retry may succeed.
    #[error("recoverable fetch error: {0}")]
    Recoverable(String),

    /// Permanent upstream rejection; retrying cannot succeed.
    #[error("fatal fetch error: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Whether this failure may be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }
}

/// Downloads recording audio from the telephony provider.
///
/// The engine treats the transfer as opaque: it hands over a URL and gets
/// back bytes or a classified error.
#[async_trait]
pub trait RecordingFetcher: Send + Sync + std::fmt::Debug + 'static {
    /// Fetch the recording at `url`.
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}
