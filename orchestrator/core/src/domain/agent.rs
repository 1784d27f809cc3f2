// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a pooled agent.
///
/// ```text
/// spawned → initializing → ready ⇄ executing → retiring → terminated
///                 ↓
///               failed → initializing (retry) | retiring
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawned,
    Initializing,
    Ready,
    Executing,
    Retiring,
    Terminated,
    Failed,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Spawned => "spawned",
            AgentState::Initializing => "initializing",
            AgentState::Ready => "ready",
            AgentState::Executing => "executing",
            AgentState::Retiring => "retiring",
            AgentState::Terminated => "terminated",
            AgentState::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: AgentState) -> bool {
        use AgentState::*;
        matches!(
            (self, next),
            (Spawned, Initializing)
                | (Failed, Initializing)
                | (Initializing, Ready)
                | (Initializing, Failed)
                | (Ready, Executing)
                | (Executing, Ready)
                | (Spawned, Retiring)
                | (Ready, Retiring)
                | (Executing, Retiring)
                | (Failed, Retiring)
                | (Retiring, Terminated)
                | (Retiring, Failed)
        )
    }

    /// Agents in these states still count against pool capacity.
    pub fn is_active(&self) -> bool {
        !matches!(self, AgentState::Terminated)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lightweight view of a pooled worker. Owned by the lifecycle manager;
/// everything else holds the `id` only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHandle {
    pub id: AgentId,
    pub agent_type: String,
    pub state: AgentState,
    pub task_queue_depth: usize,
    pub spawned_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentHandle {
    pub fn new(agent_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            agent_type: agent_type.into(),
            state: AgentState::Spawned,
            task_queue_depth: 0,
            spawned_at: now,
            updated_at: now,
        }
    }
}
