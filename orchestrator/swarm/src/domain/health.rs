// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Pool health and task assignment outcomes.

use fleet_core::domain::agent::{AgentId, AgentState};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still functioning: fallback transport in use, peers missing or agents failed.
    Degraded,
    /// Store writes are failing or every peer was lost to exhausted retries.
    Broken,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetHealth {
    pub agents_by_state: BTreeMap<AgentState, usize>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub peers_connected: usize,
    pub peers_total: usize,
    pub peers_evicted: u64,
    pub fallback_active: bool,
    pub store_write_failures: u64,
    pub sync_error_rate: f64,
    pub status: HealthStatus,
}

impl FleetHealth {
    pub fn agents_in(&self, state: AgentState) -> usize {
        self.agents_by_state.get(&state).copied().unwrap_or(0)
    }

    /// Derive `status` from the other fields.
    pub fn classify(mut self) -> Self {
        let all_peers_lost = self.peers_evicted > 0 && self.peers_connected == 0;
        self.status = if self.store_write_failures > 0 || all_peers_lost {
            HealthStatus::Broken
        } else if self.fallback_active
            || self.peers_connected < self.peers_total
            || self.peers_evicted > 0
            || self.agents_in(AgentState::Failed) > 0
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        self
    }
}

/// Where `assign_task` put the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskAssignment {
    Assigned { agent_id: AgentId },
    /// Waiting for a free agent; `position` is 1-based.
    Queued { position: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> FleetHealth {
        FleetHealth {
            agents_by_state: BTreeMap::from([(AgentState::Ready, 2)]),
            queue_depth: 0,
            queue_capacity: 32,
            peers_connected: 2,
            peers_total: 2,
            peers_evicted: 0,
            fallback_active: false,
            store_write_failures: 0,
            sync_error_rate: 0.0,
            status: HealthStatus::Healthy,
        }
    }

    #[test]
    fn test_classification() {
        assert_eq!(baseline().classify().status, HealthStatus::Healthy);

        let fallback = FleetHealth {
            fallback_active: true,
            ..baseline()
        };
        assert_eq!(fallback.classify().status, HealthStatus::Degraded);

        let missing_peer = FleetHealth {
            peers_connected: 1,
            ..baseline()
        };
        assert_eq!(missing_peer.classify().status, HealthStatus::Degraded);

        let write_failures = FleetHealth {
            store_write_failures: 1,
            ..baseline()
        };
        assert_eq!(write_failures.classify().status, HealthStatus::Broken);

        let isolated = FleetHealth {
            peers_connected: 0,
            peers_total: 0,
            peers_evicted: 2,
            ..baseline()
        };
        assert_eq!(isolated.classify().status, HealthStatus::Broken);
    }
}
