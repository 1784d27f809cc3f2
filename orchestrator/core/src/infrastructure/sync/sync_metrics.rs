// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::Serialize;
use std::time::Duration;

/// Smoothing factor of the sync duration moving average.
pub const DURATION_EMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncMetrics {
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    pub avg_sync_duration_ms: f64,
    /// `failed_syncs / total_syncs`, 0.0 before the first sync.
    pub error_rate: f64,
    pub active_peers: usize,
    /// Peers currently linked over the non-preferred transport.
    pub fallback_connections: usize,
    /// `fallback.transport` events published since start.
    pub fallback_events: u64,
    /// Peers dropped after their retry budget ran out.
    pub peers_evicted: u64,
}

impl SyncMetrics {
    pub(crate) fn record_success(&mut self, duration: Duration) {
        self.total_syncs += 1;
        self.successful_syncs += 1;
        let sample = duration.as_secs_f64() * 1000.0;
        self.avg_sync_duration_ms = if self.successful_syncs == 1 {
            sample
        } else {
            DURATION_EMA_ALPHA * sample + (1.0 - DURATION_EMA_ALPHA) * self.avg_sync_duration_ms
        };
        self.refresh_error_rate();
    }

    pub(crate) fn record_failure(&mut self) {
        self.total_syncs += 1;
        self.failed_syncs += 1;
        self.refresh_error_rate();
    }

    fn refresh_error_rate(&mut self) {
        self.error_rate = self.failed_syncs as f64 / self.total_syncs as f64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_average_is_exponential() {
        let mut metrics = SyncMetrics::default();
        metrics.record_success(Duration::from_millis(100));
        assert_eq!(metrics.avg_sync_duration_ms, 100.0);

        metrics.record_success(Duration::from_millis(200));
        assert!((metrics.avg_sync_duration_ms - 120.0).abs() < 1e-9);

        metrics.record_failure();
        assert_eq!(metrics.total_syncs, 3);
        assert!((metrics.error_rate - 1.0 / 3.0).abs() < 1e-9);
    }
}
