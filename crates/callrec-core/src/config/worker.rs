//! Download worker configuration.

use serde::{Deserialize, Serialize};

/// Download worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the worker is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of concurrent download tasks this process may run across all
    /// tenants. Per-tenant admission is still governed by the slot table.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Timeout for a single provider fetch, in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_seconds: u64,
    /// Root directory for stored recording artifacts.
    #[serde(default = "default_data_root")]
    pub data_root: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            concurrency: default_concurrency(),
            fetch_timeout_seconds: default_fetch_timeout(),
            data_root: default_data_root(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    8
}

fn default_fetch_timeout() -> u64 {
    600
}

fn default_data_root() -> String {
    "./data".to_string()
}
