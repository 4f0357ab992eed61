//! Download job status enumeration.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a recording download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "download_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Waiting for a worker slot (or for a worker to pick it up).
    Queued,
    /// Currently being downloaded by a worker.
    Running,
    /// Audio fetched and stored.
    Completed,
    /// Download failed; `error_message` carries the reason.
    Failed,
    /// Cancelled before the fetch started.
    Cancelled,
}

impl DownloadStatus {
    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job still counts toward the one-active-per-recording
    /// invariant.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    /// Return the status as a lowercase string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_and_terminal_partition() {
        for status in [
            DownloadStatus::Queued,
            DownloadStatus::Running,
            DownloadStatus::Completed,
            DownloadStatus::Failed,
            DownloadStatus::Cancelled,
        ] {
            assert_ne!(status.is_active(), status.is_terminal());
        }
    }
}
