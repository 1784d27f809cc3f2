// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Behaviors
//!
//! The substrate does not know what an agent does. Domain behaviors plug in
//! through [`AgentBehavior`], one implementation per agent type, and reach
//! shared state only through the [`AgentContext`] handed to them.
//!
//! ## Private write staging
//!
//! Behaviors may stage private records with [`AgentContext::stage_private`]
//! instead of writing them immediately. Staged writes are flushed into the
//! record store when the agent retires, before it reaches `terminated`.

use async_trait::async_trait;
use fleet_core::domain::agent::AgentId;
use fleet_core::domain::events::Event;
use fleet_core::domain::task::Task;
use fleet_core::infrastructure::event_bus::EventBus;
use fleet_core::infrastructure::record_store::AgentStoreView;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Result value of a successful task execution.
pub type TaskOutput = serde_json::Value;

#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Agent type this behavior serves, e.g. `"coverage-analyzer"`.
    fn agent_type(&self) -> &str;

    /// One-time setup. Runs at most once per successful initialization.
    async fn initialize(&self, ctx: &AgentContext) -> anyhow::Result<()>;

    async fn execute(&self, ctx: &AgentContext, task: &Task) -> anyhow::Result<TaskOutput>;
}

/// A private write held back until the agent retires.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    pub partition: String,
    pub key: String,
    pub value: Vec<u8>,
    pub ttl: Option<Duration>,
}

pub struct AgentContext {
    agent_id: AgentId,
    agent_type: String,
    store: AgentStoreView,
    event_bus: EventBus,
    pending: Mutex<Vec<PendingWrite>>,
}

impl AgentContext {
    pub fn new(agent_type: impl Into<String>, store: AgentStoreView, event_bus: EventBus) -> Self {
        Self {
            agent_id: store.agent_id(),
            agent_type: agent_type.into(),
            store,
            event_bus,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn store(&self) -> &AgentStoreView {
        &self.store
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Publish an event attributed to this agent.
    pub fn publish(&self, topic: impl Into<String>, payload: serde_json::Value) {
        self.event_bus
            .publish(Event::new(topic, payload).with_source(self.agent_id));
    }

    /// Queue a private write for the retirement flush. A later write to the
    /// same `(partition, key)` replaces the earlier one.
    pub fn stage_private(
        &self,
        partition: impl Into<String>,
        key: impl Into<String>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) {
        let write = PendingWrite {
            partition: partition.into(),
            key: key.into(),
            value,
            ttl,
        };
        let mut pending = self.pending.lock();
        pending.retain(|w| w.partition != write.partition || w.key != write.key);
        pending.push(write);
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn take_pending(&self) -> Vec<PendingWrite> {
        std::mem::take(&mut *self.pending.lock())
    }

    /// Put writes that could not be flushed back in front of anything staged since.
    pub(crate) fn restore_pending(&self, mut writes: Vec<PendingWrite>) {
        let mut pending = self.pending.lock();
        writes.append(&mut pending);
        *pending = writes;
    }
}

/// Behaviors by agent type.
#[derive(Default, Clone)]
pub struct BehaviorRegistry {
    behaviors: HashMap<String, Arc<dyn AgentBehavior>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `behavior` under its own agent type, replacing any earlier one.
    pub fn register(&mut self, behavior: Arc<dyn AgentBehavior>) -> &mut Self {
        self.behaviors
            .insert(behavior.agent_type().to_string(), behavior);
        self
    }

    pub fn with(mut self, behavior: Arc<dyn AgentBehavior>) -> Self {
        self.register(behavior);
        self
    }

    pub fn get(&self, agent_type: &str) -> Option<Arc<dyn AgentBehavior>> {
        self.behaviors.get(agent_type).cloned()
    }

    pub fn agent_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.behaviors.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::infrastructure::record_store::RecordStore;

    struct Echo;

    #[async_trait]
    impl AgentBehavior for Echo {
        fn agent_type(&self) -> &str {
            "echo"
        }

        async fn initialize(&self, _ctx: &AgentContext) -> anyhow::Result<()> {
            Ok(())
        }

        async fn execute(&self, _ctx: &AgentContext, task: &Task) -> anyhow::Result<TaskOutput> {
            Ok(task.payload.clone())
        }
    }

    fn context() -> AgentContext {
        let store = Arc::new(RecordStore::temporary("node-a").unwrap());
        AgentContext::new("echo", store.agent_view(AgentId::new()), EventBus::new())
    }

    #[test]
    fn test_staging_same_key_keeps_latest() {
        let ctx = context();
        ctx.stage_private("coordination", "scratch", b"one".to_vec(), None);
        ctx.stage_private("coordination", "notes", b"n".to_vec(), None);
        ctx.stage_private("coordination", "scratch", b"two".to_vec(), None);

        let pending = ctx.take_pending();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].key, "notes");
        assert_eq!(pending[1].value, b"two");
        assert_eq!(ctx.pending_writes(), 0);
    }

    #[test]
    fn test_registry_lookup_by_type() {
        let registry = BehaviorRegistry::new().with(Arc::new(Echo));
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.agent_types(), vec!["echo"]);
    }

    #[test]
    fn test_registered_behavior_executes_task() {
        let registry = BehaviorRegistry::new().with(Arc::new(Echo));
        let behavior = registry.get("echo").unwrap();
        let ctx = context();
        let task = Task::new("echo", serde_json::json!({ "file": "src/lib.rs" }));

        tokio_test::block_on(behavior.initialize(&ctx)).unwrap();
        let output = tokio_test::block_on(behavior.execute(&ctx, &task)).unwrap();
        assert_eq!(output, serde_json::json!({ "file": "src/lib.rs" }));
    }
}
