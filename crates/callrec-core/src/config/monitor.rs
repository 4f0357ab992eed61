//! Stuck-job monitor and retry-budget configuration.

use serde::{Deserialize, Serialize};

/// Stuck-job monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Whether the monitor is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cron expression for monitor sweeps.
    #[serde(default = "default_cron")]
    pub cron: String,
    /// Age after which a queued or running job is considered stuck, judged
    /// from its own `created_at`/`started_at`, in seconds.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_seconds: i64,
    /// Maximum retry attempts per (tenant, recording) within the window.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Rolling retry window, in seconds.
    #[serde(default = "default_retry_window")]
    pub retry_window_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cron: default_cron(),
            stuck_after_seconds: default_stuck_after(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_window_seconds: default_retry_window(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_cron() -> String {
    // Every minute.
    "0 * * * * *".to_string()
}

fn default_stuck_after() -> i64 {
    300
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_retry_window() -> u64 {
    600
}
