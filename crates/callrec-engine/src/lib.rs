//! # callrec-engine
//!
//! The acquisition engine proper: the submit deduplication gate, the
//! download worker loop with guaranteed slot release, the stuck-job
//! monitor with bounded retry, and the concrete provider fetcher and
//! artifact store.

pub mod artifact;
pub mod dispatcher;
pub mod fetcher;
pub mod monitor;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use dispatcher::ChannelDispatcher;
pub use monitor::StuckJobMonitor;
pub use retry::RetryBudget;
pub use service::{CancelOutcome, RecordingService, StatusReport, SubmitOutcome};
pub use worker::{DownloadWorker, WorkerRunner};
