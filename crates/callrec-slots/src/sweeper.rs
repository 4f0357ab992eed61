//! Background liveness sweeper.
//!
//! The acquire script already evicts dead holders inline, but a tenant
//! with no submission traffic would otherwise keep crashed holders in its
//! slot set until someone shows up. This task walks every tenant on a
//! fixed interval so idle tenants heal too.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time;
use tracing::{debug, error, info};

use crate::allocator::SlotAllocator;

/// Periodic sweep task over all tenants.
#[derive(Debug)]
pub struct SlotSweeper {
    allocator: Arc<dyn SlotAllocator>,
    interval: Duration,
}

impl SlotSweeper {
    /// Create a new sweeper.
    pub fn new(allocator: Arc<dyn SlotAllocator>, interval_seconds: u64) -> Self {
        Self {
            allocator,
            interval: Duration::from_secs(interval_seconds),
        }
    }

    /// Run until the cancel signal is received.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        info!(interval_seconds = self.interval.as_secs(), "Slot sweeper started");

        let mut ticker = time::interval(self.interval);
        // The first tick fires immediately; skip it so startup isn't noisy.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        info!("Slot sweeper received shutdown signal");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match self.allocator.sweep_all().await {
                        Ok(0) => debug!("Sweep pass complete, nothing to reclaim"),
                        Ok(removed) => info!(removed, "Sweep pass reclaimed slots"),
                        Err(e) => error!(error = %e, "Sweep pass failed"),
                    }
                }
            }
        }

        info!("Slot sweeper shut down");
    }
}
