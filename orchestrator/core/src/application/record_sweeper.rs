// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Record Sweeper - Background task reclaiming expired records
//!
//! Expired records are already invisible to readers; this task frees
//! their storage on a fixed cadence.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Periodic `sweep_expired` on the record store

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::record::StoreError;
use crate::infrastructure::record_store::RecordStore;

pub struct RecordSweeper {
    store: Arc<RecordStore>,
    interval: Duration,
    shutdown_token: CancellationToken,
}

impl RecordSweeper {
    pub fn new(store: Arc<RecordStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Get a handle to trigger shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Start the sweeper background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(interval = ?self.interval, "Starting record sweeper background task");

        let mut tick = interval(self.interval);
        // The first tick fires immediately; nothing has expired yet.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    match self.sweep_cycle() {
                        Ok(0) => debug!("Record sweep found nothing to reclaim"),
                        Ok(removed) => info!(removed, "Record sweep cycle completed"),
                        Err(e) => warn!("Record sweep cycle failed: {}", e),
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping record sweeper");
                    break;
                }
            }
        }

        info!("Record sweeper background task stopped");
    }

    /// Execute a single sweep
    pub fn sweep_cycle(&self) -> Result<usize, StoreError> {
        self.store.sweep_expired()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record::PutOptions;

    #[tokio::test]
    async fn test_sweeper_reclaims_and_stops() {
        let store = Arc::new(RecordStore::temporary("node-a").unwrap());
        store
            .put(
                "events",
                "short-lived",
                vec![1],
                PutOptions::public().with_ttl(Duration::from_millis(10)),
            )
            .unwrap();

        let sweeper = Arc::new(RecordSweeper::new(Arc::clone(&store), Duration::from_millis(20)));
        let token = sweeper.shutdown_token();
        let handle = Arc::clone(&sweeper).start();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.stats().unwrap().total_entries, 0);
        assert_eq!(sweeper.sweep_cycle().unwrap(), 0);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper should stop on cancellation")
            .unwrap();
    }
}
