// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::domain::agent::{AgentId, AgentState};
use crate::domain::peer::{PeerId, TransportKind};
use crate::domain::task::TaskId;

/// Stable topic names external agent logic may subscribe to.
pub mod topics {
    pub const AGENT_LIFECYCLE_PREFIX: &str = "agent.lifecycle";
    pub const AGENT_LIFECYCLE_ALL: &str = "agent.lifecycle.*";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_QUEUED: &str = "task.queued";
    pub const TASK_REJECTED: &str = "task.rejected";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const PEER_CONNECTED: &str = "peer.connected";
    pub const PEER_DISCONNECTED: &str = "peer.disconnected";
    pub const PEER_SYNC_COMPLETED: &str = "peer.sync-completed";
    pub const PEER_SYNC_FAILED: &str = "peer.sync-failed";
    pub const FALLBACK_TRANSPORT: &str = "fallback.transport";
    pub const RECORD_REMOTE_UPDATE: &str = "record.remote-update";
}

/// Immutable in-process notification. Never persisted, never replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source_agent_id: Option<AgentId>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            timestamp: Utc::now(),
            source_agent_id: None,
        }
    }

    pub fn with_source(mut self, agent_id: AgentId) -> Self {
        self.source_agent_id = Some(agent_id);
        self
    }

    /// Decode the payload back into one of the typed event enums.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Typed events that know their topic.
pub trait DomainEvent: Serialize {
    fn topic(&self) -> String;

    fn source_agent(&self) -> Option<AgentId> {
        None
    }

    fn into_event(self) -> Event
    where
        Self: Sized,
    {
        let topic = self.topic();
        let source = self.source_agent();
        let payload = serde_json::to_value(&self).unwrap_or(serde_json::Value::Null);
        let event = Event::new(topic, payload);
        match source {
            Some(agent_id) => event.with_source(agent_id),
            None => event,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentLifecycleEvent {
    Transitioned {
        agent_id: AgentId,
        agent_type: String,
        from: Option<AgentState>,
        to: AgentState,
        at: DateTime<Utc>,
    },
    Failed {
        agent_id: AgentId,
        agent_type: String,
        phase: String,
        reason: String,
        failed_at: DateTime<Utc>,
    },
}

impl DomainEvent for AgentLifecycleEvent {
    fn topic(&self) -> String {
        let state = match self {
            AgentLifecycleEvent::Transitioned { to, .. } => to.as_str(),
            AgentLifecycleEvent::Failed { .. } => AgentState::Failed.as_str(),
        };
        format!("{}.{}", topics::AGENT_LIFECYCLE_PREFIX, state)
    }

    fn source_agent(&self) -> Option<AgentId> {
        match self {
            AgentLifecycleEvent::Transitioned { agent_id, .. }
            | AgentLifecycleEvent::Failed { agent_id, .. } => Some(*agent_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    Assigned {
        task_id: TaskId,
        agent_id: AgentId,
        assigned_at: DateTime<Utc>,
    },
    Queued {
        task_id: TaskId,
        position: usize,
        queued_at: DateTime<Utc>,
    },
    Rejected {
        task_id: TaskId,
        reason: String,
        rejected_at: DateTime<Utc>,
    },
    Completed {
        task_id: TaskId,
        agent_id: AgentId,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    Failed {
        task_id: TaskId,
        agent_id: Option<AgentId>,
        error: String,
        failed_at: DateTime<Utc>,
    },
}

impl DomainEvent for TaskEvent {
    fn topic(&self) -> String {
        match self {
            TaskEvent::Assigned { .. } => topics::TASK_ASSIGNED,
            TaskEvent::Queued { .. } => topics::TASK_QUEUED,
            TaskEvent::Rejected { .. } => topics::TASK_REJECTED,
            TaskEvent::Completed { .. } => topics::TASK_COMPLETED,
            TaskEvent::Failed { .. } => topics::TASK_FAILED,
        }
        .to_string()
    }

    fn source_agent(&self) -> Option<AgentId> {
        match self {
            TaskEvent::Assigned { agent_id, .. } | TaskEvent::Completed { agent_id, .. } => {
                Some(*agent_id)
            }
            TaskEvent::Failed { agent_id, .. } => *agent_id,
            TaskEvent::Queued { .. } | TaskEvent::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerEvent {
    Connected {
        peer_id: PeerId,
        transport: TransportKind,
        remote_node_id: String,
        connected_at: DateTime<Utc>,
    },
    Disconnected {
        peer_id: PeerId,
        reason: String,
        disconnected_at: DateTime<Utc>,
    },
    SyncCompleted {
        peer_id: PeerId,
        entries_sent: usize,
        entries_rejected: usize,
        batches: usize,
        duration_ms: u64,
        completed_at: DateTime<Utc>,
    },
    SyncFailed {
        peer_id: PeerId,
        error: String,
        failed_at: DateTime<Utc>,
    },
    FallbackTransport {
        peer_id: PeerId,
        from: TransportKind,
        to: TransportKind,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl DomainEvent for PeerEvent {
    fn topic(&self) -> String {
        match self {
            PeerEvent::Connected { .. } => topics::PEER_CONNECTED,
            PeerEvent::Disconnected { .. } => topics::PEER_DISCONNECTED,
            PeerEvent::SyncCompleted { .. } => topics::PEER_SYNC_COMPLETED,
            PeerEvent::SyncFailed { .. } => topics::PEER_SYNC_FAILED,
            PeerEvent::FallbackTransport { .. } => topics::FALLBACK_TRANSPORT,
        }
        .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordEvent {
    RemoteUpdate {
        partition: String,
        key: String,
        version: u64,
        origin: String,
        applied_at: DateTime<Utc>,
    },
}

impl DomainEvent for RecordEvent {
    fn topic(&self) -> String {
        topics::RECORD_REMOTE_UPDATE.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_topic_follows_target_state() {
        let agent_id = AgentId::new();
        let event = AgentLifecycleEvent::Transitioned {
            agent_id,
            agent_type: "coverage-analyzer".to_string(),
            from: Some(AgentState::Initializing),
            to: AgentState::Ready,
            at: Utc::now(),
        }
        .into_event();

        assert_eq!(event.topic, "agent.lifecycle.ready");
        assert_eq!(event.source_agent_id, Some(agent_id));
        assert_eq!(event.payload["type"], "transitioned");
    }

    #[test]
    fn test_event_payload_decodes_back() {
        let event = PeerEvent::FallbackTransport {
            peer_id: PeerId::new("127.0.0.1", 7400),
            from: TransportKind::Datagram,
            to: TransportKind::Stream,
            reason: "handshake timed out".to_string(),
            at: Utc::now(),
        }
        .into_event();

        assert_eq!(event.topic, topics::FALLBACK_TRANSPORT);
        let decoded: PeerEvent = event.decode().unwrap();
        assert!(matches!(decoded, PeerEvent::FallbackTransport { to: TransportKind::Stream, .. }));
    }
}
