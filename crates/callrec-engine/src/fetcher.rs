//! HTTP recording fetcher against the telephony provider.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use tracing::debug;

use callrec_core::error::{AppError, ErrorKind};
use callrec_core::result::AppResult;
use callrec_core::traits::fetcher::{FetchError, RecordingFetcher};

/// Fetches recording audio over HTTP with a bounded per-request timeout.
///
/// Classification: timeouts, connection failures and 5xx/429 responses
/// are recoverable; 401/403/404/410 mean the provider will never hand
/// this recording over and are fatal.
#[derive(Debug, Clone)]
pub struct HttpRecordingFetcher {
    client: reqwest::Client,
}

impl HttpRecordingFetcher {
    /// Create a fetcher with the given request timeout.
    pub fn new(fetch_timeout_seconds: u64) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(fetch_timeout_seconds))
            .build()
            .map_err(|e| {
                AppError::with_source(ErrorKind::Upstream, "Failed to build HTTP client", e)
            })?;
        Ok(Self { client })
    }

    fn classify_status(status: StatusCode) -> FetchError {
        match status {
            StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::NOT_FOUND
            | StatusCode::GONE => {
                FetchError::Fatal(format!("provider rejected the recording: HTTP {status}"))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                FetchError::Recoverable(format!("provider unavailable: HTTP {status}"))
            }
            s => FetchError::Fatal(format!("unexpected provider response: HTTP {s}")),
        }
    }
}

#[async_trait]
impl RecordingFetcher for HttpRecordingFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                FetchError::Recoverable(format!("provider request failed: {e}"))
            } else {
                FetchError::Fatal(format!("provider request failed: {e}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify_status(status));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Recoverable(format!("provider body read failed: {e}")))?;

        debug!(url, bytes = body.len(), "Recording fetched");
        Ok(body)
    }
}
