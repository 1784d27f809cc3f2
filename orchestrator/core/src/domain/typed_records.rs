// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Typed wrappers over opaque record payloads.
//!
//! The store never looks inside a value. Each logical record kind lives in a
//! fixed partition, derives its key from its own fields and encodes itself as
//! JSON.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::agent::{AgentId, AgentState};
use crate::domain::record::{partitions, StoreError};
use crate::domain::task::TaskId;

pub trait TypedRecord: Serialize + DeserializeOwned {
    const PARTITION: &'static str;

    fn key(&self) -> String;

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::WriteRejected {
            partition: Self::PARTITION.to_string(),
            key: self.key(),
            reason: format!("serialization failed: {}", e),
        })
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            partition: Self::PARTITION.to_string(),
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateRecord {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub state: AgentState,
    pub task_queue_depth: usize,
    pub updated_at: DateTime<Utc>,
}

impl AgentStateRecord {
    pub fn key_for(agent_id: AgentId) -> String {
        format!("agent/{}/state", agent_id)
    }
}

impl TypedRecord for AgentStateRecord {
    const PARTITION: &'static str = partitions::COORDINATION;

    fn key(&self) -> String {
        Self::key_for(self.agent_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultRecord {
    pub task_id: TaskId,
    pub agent_id: Option<AgentId>,
    pub agent_type: String,
    pub success: bool,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

impl TaskResultRecord {
    pub fn key_for(task_id: TaskId) -> String {
        format!("task/{}/result", task_id)
    }
}

impl TypedRecord for TaskResultRecord {
    const PARTITION: &'static str = partitions::COORDINATION;

    fn key(&self) -> String {
        Self::key_for(self.task_id)
    }
}

/// Learned pattern produced by the out-of-process learning component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRecord {
    pub id: Uuid,
    pub pattern_type: String,
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub discovered_at: DateTime<Utc>,
}

impl TypedRecord for PatternRecord {
    const PARTITION: &'static str = partitions::PATTERNS;

    fn key(&self) -> String {
        format!("{}/{}", self.pattern_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: f64,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub recorded_at: DateTime<Utc>,
}

impl TypedRecord for MetricRecord {
    const PARTITION: &'static str = partitions::METRICS;

    fn key(&self) -> String {
        format!("{}/{:020}", self.name, self.recorded_at.timestamp_millis().max(0))
    }
}
